use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use todo::query;
use todo::{FileFormat, Loaded, MarkDone, NewTask, Status, Task, TaskId, TaskPatch, TaskStore};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "todo",
    about = "Personal task list kept in a plain text or CSV file",
    version
)]
struct Cli {
    /// Task file to read and write. Created on the first save.
    #[arg(long, short, global = true, default_value = "tasks.txt")]
    file: PathBuf,
    /// File format. Inferred from the extension when omitted (.csv is CSV).
    #[arg(long, global = true, value_enum)]
    format: Option<FormatArg>,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Add a new pending task.
    Add(AddArgs),

    /// List tasks sorted by due date.
    List(ListArgs),

    /// Mark a task from the listing as done.
    Done(SelectArgs),

    /// Change some fields of a task; fields not given are kept.
    Edit(EditArgs),

    /// Delete a task from the listing.
    Delete(SelectArgs),

    /// Rewrite the task file in another format.
    Convert(ConvertArgs),
}

#[derive(Debug, Args)]
struct AddArgs {
    /// Task title. Must not contain '|'.
    title: String,
    /// Due date (DD-MM-YYYY or YYYY-MM-DD). Omit for no date.
    #[arg(long)]
    due: Option<String>,
    /// low, medium or high (or 1, 2, 3).
    #[arg(long, short)]
    priority: Option<String>,
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Only show tasks with this status (pending or done).
    #[arg(long)]
    status: Option<String>,
    /// Emit JSON instead of a numbered list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SelectArgs {
    /// Task number as shown by `list`.
    number: usize,
    /// Number within `list --status <STATUS>` instead of the full listing.
    #[arg(long)]
    status: Option<String>,
}

#[derive(Debug, Args)]
struct EditArgs {
    #[command(flatten)]
    select: SelectArgs,
    #[arg(long)]
    title: Option<String>,
    /// New due date, or `none` to clear it.
    #[arg(long)]
    due: Option<String>,
    #[arg(long)]
    priority: Option<String>,
    /// New status (pending or done).
    #[arg(long = "set-status")]
    set_status: Option<String>,
}

#[derive(Debug, Args)]
struct ConvertArgs {
    /// Destination file.
    output: PathBuf,
    /// Destination format. Inferred from the destination extension when omitted.
    #[arg(long, value_enum)]
    to: Option<FormatArg>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FormatArg {
    Lines,
    Csv,
}

impl From<FormatArg> for FileFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Lines => FileFormat::Lines,
            FormatArg::Csv => FileFormat::Csv,
        }
    }
}

/// Where the tasks live and how they are encoded, resolved from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    file: PathBuf,
    format: FileFormat,
}

impl Settings {
    fn resolve(file: PathBuf, format: Option<FormatArg>) -> Self {
        let format = format
            .map(FileFormat::from)
            .unwrap_or_else(|| FileFormat::from_path(&file));
        Self { file, format }
    }

    fn load(&self) -> Result<TaskStore> {
        let Loaded { store, warnings } = todo::load(&self.file, self.format)
            .with_context(|| format!("loading {:?}", self.file))?;
        for warning in warnings {
            eprintln!("warning: skipped {warning}");
        }
        Ok(store)
    }

    fn save(&self, store: &TaskStore) -> Result<()> {
        todo::save(store, &self.file, self.format).with_context(|| format!("saving {:?}", self.file))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let settings = Settings::resolve(cli.file, cli.format);
    tracing::debug!(?settings, "resolved settings");
    match cli.command {
        Commands::Add(args) => handle_add(&settings, args),
        Commands::List(args) => handle_list(&settings, args),
        Commands::Done(args) => handle_done(&settings, args),
        Commands::Edit(args) => handle_edit(&settings, args),
        Commands::Delete(args) => handle_delete(&settings, args),
        Commands::Convert(args) => handle_convert(&settings, args),
    }
}

/// `RUST_LOG` wins; otherwise warnings only, or debug with `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "todo=debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

fn handle_add(settings: &Settings, args: AddArgs) -> Result<()> {
    let AddArgs {
        title,
        due,
        priority,
    } = args;
    let mut store = settings.load()?;
    let new = NewTask::new(title)
        .due(due.unwrap_or_default())
        .priority(priority.unwrap_or_default());
    let id = store.add(new).context("adding task")?;
    settings.save(&store)?;
    if let Some(task) = store.get(id) {
        println!("Added: {}", describe(task));
    }
    Ok(())
}

fn handle_list(settings: &Settings, args: ListArgs) -> Result<()> {
    let ListArgs { status, json } = args;
    let status = parse_status_filter(status.as_deref())?;
    let store = settings.load()?;
    let listing = query::listing(store.iter(), status);

    if json {
        #[derive(serde::Serialize)]
        struct JsonRow<'a> {
            number: usize,
            #[serde(flatten)]
            task: &'a Task,
        }

        let rows: Vec<JsonRow<'_>> = listing
            .iter()
            .copied()
            .enumerate()
            .map(|(idx, task)| JsonRow {
                number: idx + 1,
                task,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if listing.is_empty() {
        match status {
            Some(status) => println!("No tasks with status: {status}"),
            None => println!("No tasks found."),
        }
        return Ok(());
    }
    let today = Local::now().date_naive();
    for line in render_listing(&listing, today) {
        println!("{line}");
    }
    Ok(())
}

fn handle_done(settings: &Settings, args: SelectArgs) -> Result<()> {
    let mut store = settings.load()?;
    let id = select(&store, &args)?;
    match store.mark_done(id)? {
        MarkDone::Completed => {
            settings.save(&store)?;
            println!("Task marked as complete.");
        }
        MarkDone::AlreadyDone => println!("This task is already marked as done."),
    }
    Ok(())
}

fn handle_edit(settings: &Settings, args: EditArgs) -> Result<()> {
    let EditArgs {
        select: selection,
        title,
        due,
        priority,
        set_status,
    } = args;
    let patch = TaskPatch {
        title,
        due,
        priority,
        status: set_status,
    };
    if patch.is_empty() {
        anyhow::bail!("nothing to change; pass --title, --due, --priority or --set-status");
    }

    let mut store = settings.load()?;
    let id = select(&store, &selection)?;
    store.edit(id, patch).context("editing task")?;
    settings.save(&store)?;
    if let Some(task) = store.get(id) {
        println!("Task updated: {}", describe(task));
    }
    Ok(())
}

fn handle_delete(settings: &Settings, args: SelectArgs) -> Result<()> {
    let mut store = settings.load()?;
    let id = select(&store, &args)?;
    let removed = store.delete(id)?;
    settings.save(&store)?;
    println!("Task deleted: {}", describe(&removed));
    Ok(())
}

fn handle_convert(settings: &Settings, args: ConvertArgs) -> Result<()> {
    let ConvertArgs { output, to } = args;
    if same_file(&settings.file, &output) {
        anyhow::bail!("{:?} is both the source and the destination", output);
    }
    let target = Settings::resolve(output, to);
    let store = settings.load()?;
    target.save(&store)?;
    println!(
        "Wrote {} tasks to {:?} ({:?})",
        store.len(),
        target.file,
        target.format
    );
    Ok(())
}

/// Map a number from the listing the user saw to a stable task id.
fn select(store: &TaskStore, args: &SelectArgs) -> Result<TaskId> {
    let status = parse_status_filter(args.status.as_deref())?;
    let listing = query::listing(store.iter(), status);
    Ok(query::resolve_position(&listing, args.number)?)
}

fn parse_status_filter(raw: Option<&str>) -> Result<Option<Status>> {
    raw.map(str::parse::<Status>)
        .transpose()
        .context("parsing --status")
}

fn render_listing(listing: &[&Task], today: NaiveDate) -> Vec<String> {
    listing
        .iter()
        .enumerate()
        .map(|(idx, task)| {
            let overdue = if task.is_overdue(today) { " (overdue)" } else { "" };
            format!("{}. {}{}", idx + 1, describe(task), overdue)
        })
        .collect()
}

fn describe(task: &Task) -> String {
    let due = match task.due.date() {
        Some(_) => task.due.to_day_first(),
        None => "no due date".to_string(),
    };
    let category = match task.category.as_deref() {
        Some(category) if !category.is_empty() => category.to_string(),
        _ => task.priority.to_string(),
    };
    format!("[{}] ({}) {} - {}", task.status, category, due, task.title)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
