//! Task-list domain library.
//! The core stays pure: records, codecs and queries never touch the filesystem;
//! `storage` is the only module doing I/O, and the binary is a thin caller.

pub mod core {
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use serde_with::{DisplayFromStr, serde_as};
    use std::{fmt, path::PathBuf, str::FromStr};
    use uuid::Uuid;

    /// Field separator of the line format. Forbidden in titles for every format
    /// so a task can always be written either way.
    pub const DELIMITER: char = '|';

    /// Persisted spelling of [`Due::NoDate`] in the line format.
    pub const NO_DATE: &str = "no date";

    /* ------------------------------- IDs ------------------------------- */

    /// Identity of a task for the lifetime of one loaded store.
    ///
    /// Assigned on creation or load and never written to disk; displayed
    /// positions are translated into ids at the CLI boundary.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TaskId(pub Uuid);

    impl TaskId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl fmt::Display for TaskId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Display::fmt(&self.0, f)
        }
    }

    /* ------------------------------ Entity ------------------------------ */

    /// One to-do item.
    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Task {
        pub id: TaskId,
        pub title: String,
        #[serde_as(as = "DisplayFromStr")]
        pub due: Due,
        #[serde_as(as = "DisplayFromStr")]
        pub priority: Priority,
        #[serde_as(as = "DisplayFromStr")]
        pub status: Status,
        /// CSV `category` cell kept verbatim when it is not the canonical
        /// spelling of `priority` (free text, or empty). CSV files write it back
        /// in place of the priority word.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub category: Option<String>,
    }

    impl Task {
        /// A new pending task. The title is trimmed and validated.
        pub fn new(title: &str, due: Due, priority: Priority) -> Result<Self> {
            Self::with_status(title, due, priority, Status::Pending)
        }

        pub fn with_status(title: &str, due: Due, priority: Priority, status: Status) -> Result<Self> {
            Ok(Self {
                id: TaskId::new(),
                title: validate_title(title)?,
                due,
                priority,
                status,
                category: None,
            })
        }

        /// Build a task from the four raw persisted fields.
        pub fn from_fields(title: &str, due: &str, priority: &str, status: &str) -> Result<Self> {
            Self::with_status(title, due.parse()?, priority.parse()?, status.parse()?)
        }

        /// Field-value equality, ignoring the process-local id.
        pub fn same_fields(&self, other: &Task) -> bool {
            self.title == other.title
                && self.due == other.due
                && self.priority == other.priority
                && self.status == other.status
                && self.category == other.category
        }

        pub fn is_done(&self) -> bool {
            self.status == Status::Done
        }

        /// Pending with a real due date strictly before `today`.
        pub fn is_overdue(&self, today: NaiveDate) -> bool {
            !self.is_done() && self.due.date().is_some_and(|date| date < today)
        }
    }

    /// Trim a title and check it can be stored in any format.
    pub fn validate_title(raw: &str) -> Result<String> {
        let title = raw.trim();
        if title.is_empty() {
            return Err(TaskError::invalid(Field::Title, "must not be empty"));
        }
        if title.contains(DELIMITER) {
            return Err(TaskError::invalid(
                Field::Title,
                format!("must not contain the '{DELIMITER}' character"),
            ));
        }
        if title.chars().any(|c| matches!(c, '\n' | '\r')) {
            return Err(TaskError::invalid(Field::Title, "must be a single line"));
        }
        Ok(title.to_string())
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// Due date of a task.
    ///
    /// Variant order drives `Ord`: every real date sorts before `NoDate`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub enum Due {
        On(NaiveDate),
        #[default]
        NoDate,
    }

    impl Due {
        pub fn date(&self) -> Option<NaiveDate> {
            match self {
                Due::On(date) => Some(*date),
                Due::NoDate => None,
            }
        }

        /// `DD-MM-YYYY`, or the `no date` sentinel. Line-format spelling.
        pub fn to_day_first(&self) -> String {
            match self {
                Due::On(date) => date.format("%d-%m-%Y").to_string(),
                Due::NoDate => NO_DATE.to_string(),
            }
        }

        /// `YYYY-MM-DD`, or empty. CSV spelling.
        pub fn to_iso(&self) -> String {
            match self {
                Due::On(date) => date.format("%Y-%m-%d").to_string(),
                Due::NoDate => String::new(),
            }
        }
    }

    impl fmt::Display for Due {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Due::On(date) => write!(f, "{}", date.format("%Y-%m-%d")),
                Due::NoDate => f.write_str(NO_DATE),
            }
        }
    }

    impl FromStr for Due {
        type Err = TaskError;

        /// Accepts the sentinel (`""`, `no date`, `none`), `DD-MM-YYYY` and
        /// `YYYY-MM-DD`. The year position keeps the two date forms apart.
        fn from_str(s: &str) -> Result<Self> {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case(NO_DATE) || s.eq_ignore_ascii_case("none") {
                return Ok(Due::NoDate);
            }
            date_syntax::parse(s).map(Due::On).ok_or_else(|| {
                TaskError::invalid(
                    Field::Due,
                    format!("{s:?} is not a valid date; use DD-MM-YYYY or YYYY-MM-DD"),
                )
            })
        }
    }

    mod date_syntax {
        use chrono::NaiveDate;
        use nom::{
            IResult,
            branch::alt,
            bytes::complete::take_while_m_n,
            character::complete::char,
            combinator::{all_consuming, map_res},
            sequence::tuple,
        };

        fn number<'a>(min: usize, max: usize) -> impl FnMut(&'a str) -> IResult<&'a str, u32> {
            map_res(
                take_while_m_n(min, max, |c: char| c.is_ascii_digit()),
                |s: &str| s.parse::<u32>(),
            )
        }

        fn iso(i: &str) -> IResult<&str, (u32, u32, u32)> {
            let (i, (year, _, month, _, day)) =
                tuple((number(4, 4), char('-'), number(1, 2), char('-'), number(1, 2)))(i)?;
            Ok((i, (year, month, day)))
        }

        fn day_first(i: &str) -> IResult<&str, (u32, u32, u32)> {
            let (i, (day, _, month, _, year)) =
                tuple((number(1, 2), char('-'), number(1, 2), char('-'), number(4, 4)))(i)?;
            Ok((i, (year, month, day)))
        }

        /// `None` for bad syntax and for dates the calendar rejects (31-02-2025).
        pub fn parse(input: &str) -> Option<NaiveDate> {
            let (_, (year, month, day)) = all_consuming(alt((iso, day_first)))(input).ok()?;
            NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, day)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub enum Priority {
        Low,
        #[default]
        Medium,
        High,
    }

    impl fmt::Display for Priority {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                Priority::Low => "low",
                Priority::Medium => "medium",
                Priority::High => "high",
            })
        }
    }

    impl FromStr for Priority {
        type Err = TaskError;

        fn from_str(s: &str) -> Result<Self> {
            match s.trim().to_lowercase().as_str() {
                "low" | "1" => Ok(Priority::Low),
                "medium" | "2" => Ok(Priority::Medium),
                "high" | "3" => Ok(Priority::High),
                _ => Err(TaskError::invalid(
                    Field::Priority,
                    format!("{s:?} is not one of low, medium, high"),
                )),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub enum Status {
        #[default]
        Pending,
        Done,
    }

    impl Status {
        /// CSV files use the `OPEN`/`DONE` vocabulary.
        pub fn as_csv(&self) -> &'static str {
            match self {
                Status::Pending => "OPEN",
                Status::Done => "DONE",
            }
        }
    }

    impl fmt::Display for Status {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                Status::Pending => "pending",
                Status::Done => "done",
            })
        }
    }

    impl FromStr for Status {
        type Err = TaskError;

        fn from_str(s: &str) -> Result<Self> {
            match s.trim().to_lowercase().as_str() {
                "pending" | "open" | "1" => Ok(Status::Pending),
                "done" | "2" => Ok(Status::Done),
                _ => Err(TaskError::invalid(
                    Field::Status,
                    format!("{s:?} is not one of pending, done"),
                )),
            }
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Field {
        Title,
        Due,
        Priority,
        Status,
    }

    impl fmt::Display for Field {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                Field::Title => "title",
                Field::Due => "due date",
                Field::Priority => "priority",
                Field::Status => "status",
            })
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum TaskError {
        #[error("invalid {field}: {reason}")]
        Validation { field: Field, reason: String },
        #[error("task index {index} is out of range for {len} tasks")]
        IndexOutOfRange { index: usize, len: usize },
        #[error("there is no task number {number}; the listing has {len} tasks")]
        NumberOutOfRange { number: usize, len: usize },
        #[error("no task with id {0}")]
        UnknownTask(TaskId),
        #[error("I/O failure on {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
    }

    impl TaskError {
        pub fn invalid(field: Field, reason: impl Into<String>) -> Self {
            TaskError::Validation {
                field,
                reason: reason.into(),
            }
        }

        /// Bad task reference: a stale id or a position outside the listing.
        pub fn is_index_error(&self) -> bool {
            matches!(
                self,
                TaskError::IndexOutOfRange { .. }
                    | TaskError::NumberOutOfRange { .. }
                    | TaskError::UnknownTask(_)
            )
        }
    }

    pub type Result<T, E = TaskError> = std::result::Result<T, E>;

}

pub mod storage {
    //! File I/O around the codecs: a missing file is an empty store, and saves
    //! replace the file through a temporary sibling and a rename.

    use crate::codec::{Decoded, FileFormat, Warning};
    use crate::core::{Result, Task, TaskError};
    use crate::store::TaskStore;
    use std::{
        fs,
        io::{self, Write},
        path::Path,
    };
    use tempfile::NamedTempFile;
    use tracing::debug;

    /// Maps a flat-file representation to and from task records.
    pub trait TaskCodec {
        /// Malformed records are skipped and reported, never fatal.
        fn decode(&self, raw: &str) -> Decoded;

        fn encode<'a>(&self, tasks: impl IntoIterator<Item = &'a Task>) -> Result<String>;
    }

    /// A store read from disk together with the records that were skipped.
    #[derive(Debug, Default)]
    pub struct Loaded {
        pub store: TaskStore,
        pub warnings: Vec<Warning>,
    }

    pub fn load(path: &Path, format: FileFormat) -> Result<Loaded> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "task file does not exist yet; starting empty");
                return Ok(Loaded::default());
            }
            Err(source) => {
                return Err(TaskError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let Decoded { tasks, warnings } = format.decode(&raw);
        for warning in &warnings {
            debug!(path = %path.display(), line = warning.line, reason = %warning.reason, "skipped record");
        }
        debug!(
            path = %path.display(),
            ?format,
            tasks = tasks.len(),
            skipped = warnings.len(),
            "loaded task file"
        );
        Ok(Loaded {
            store: TaskStore::from_tasks(tasks),
            warnings,
        })
    }

    /// Rewrite the whole file with the store's current contents.
    pub fn save(store: &TaskStore, path: &Path, format: FileFormat) -> Result<()> {
        let text = format.encode(store.iter())?;
        write_replacing(path, text.as_bytes())?;
        debug!(path = %path.display(), ?format, tasks = store.len(), "saved task file");
        Ok(())
    }

    fn write_replacing(path: &Path, bytes: &[u8]) -> Result<()> {
        let io_failure = |source: io::Error| TaskError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(io_failure)?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(io_failure)?;
        tmp.write_all(bytes).map_err(io_failure)?;
        tmp.as_file().sync_all().map_err(io_failure)?;
        tmp.persist(path).map_err(|err| io_failure(err.error))?;
        Ok(())
    }

}

pub mod codec {
    //! Flat-file codecs.
    //!
    //! - Line format: `title|due|priority|status`, one task per line, no escaping.
    //! - CSV: header-driven (`title,due,category,status`), standard quoting, parsed
    //!   with `nom` record by record so one broken row cannot sink the file.

    use crate::core::{DELIMITER, Due, Field, Priority, Result, Status, Task, TaskError};
    use crate::storage::TaskCodec;
    use std::{fmt, path::Path};

    /// A record skipped while decoding.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Warning {
        /// 1-based line where the record starts.
        pub line: usize,
        pub reason: String,
        pub raw: String,
    }

    impl fmt::Display for Warning {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "line {}: {} ({:?})", self.line, self.reason, self.raw)
        }
    }

    #[derive(Debug, Default)]
    pub struct Decoded {
        pub tasks: Vec<Task>,
        pub warnings: Vec<Warning>,
    }

    impl Decoded {
        fn skip(&mut self, line: usize, reason: impl Into<String>, raw: &str) {
            self.warnings.push(Warning {
                line,
                reason: reason.into(),
                raw: raw.to_string(),
            });
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FileFormat {
        Lines,
        Csv,
    }

    impl FileFormat {
        /// `.csv` files are CSV; everything else uses the line format.
        pub fn from_path(path: &Path) -> Self {
            if path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("csv"))
                .unwrap_or(false)
            {
                FileFormat::Csv
            } else {
                FileFormat::Lines
            }
        }

        pub fn decode(self, raw: &str) -> Decoded {
            match self {
                FileFormat::Lines => LineCodec.decode(raw),
                FileFormat::Csv => CsvCodec.decode(raw),
            }
        }

        pub fn encode<'a>(self, tasks: impl IntoIterator<Item = &'a Task>) -> Result<String> {
            match self {
                FileFormat::Lines => LineCodec.encode(tasks),
                FileFormat::Csv => CsvCodec.encode(tasks),
            }
        }
    }

    /* ------------------------------ Line format ------------------------------ */

    pub struct LineCodec;

    impl TaskCodec for LineCodec {
        fn decode(&self, raw: &str) -> Decoded {
            let mut decoded = Decoded::default();
            for (idx, line) in raw.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let fields: Vec<&str> = line.split(DELIMITER).collect();
                let [title, due, priority, status] = fields.as_slice() else {
                    decoded.skip(
                        idx + 1,
                        format!("expected 4 '{DELIMITER}'-separated fields, found {}", fields.len()),
                        line,
                    );
                    continue;
                };
                match Task::from_fields(title, due, priority, status) {
                    Ok(task) => decoded.tasks.push(task),
                    Err(err) => decoded.skip(idx + 1, err.to_string(), line),
                }
            }
            decoded
        }

        fn encode<'a>(&self, tasks: impl IntoIterator<Item = &'a Task>) -> Result<String> {
            let mut out = String::new();
            for task in tasks {
                // There is no escaping in this format; refuse rather than emit a corrupt line.
                if task.title.contains(DELIMITER) || task.title.contains('\n') {
                    return Err(TaskError::invalid(
                        Field::Title,
                        format!("{:?} cannot be written to a '{DELIMITER}'-delimited file", task.title),
                    ));
                }
                out.push_str(&task.title);
                out.push(DELIMITER);
                out.push_str(&task.due.to_day_first());
                out.push(DELIMITER);
                out.push_str(&task.priority.to_string());
                out.push(DELIMITER);
                out.push_str(&task.status.to_string());
                out.push('\n');
            }
            Ok(out)
        }
    }

    /* ---------------------------------- CSV ---------------------------------- */

    pub const CSV_HEADER: [&str; 4] = ["title", "due", "category", "status"];

    /// Record terminator written to CSV files (RFC 4180).
    pub const CSV_LINE_END: &str = "\r\n";

    pub struct CsvCodec;

    impl TaskCodec for CsvCodec {
        fn decode(&self, raw: &str) -> Decoded {
            let mut decoded = Decoded::default();
            let mut rows = csv_syntax::rows(raw).into_iter().filter(|row| !row.is_blank());

            let Some(header) = rows.next() else {
                return decoded;
            };
            let columns = match header.fields.as_deref() {
                Ok(names) => Columns::locate(names),
                Err(reason) => Err(reason.to_string()),
            };
            let columns = match columns {
                Ok(columns) => columns,
                Err(reason) => {
                    decoded.skip(header.line, format!("unusable header: {reason}"), &header.raw);
                    for row in rows {
                        decoded.skip(row.line, "no usable header", &row.raw);
                    }
                    return decoded;
                }
            };

            for row in rows {
                let task = match &row.fields {
                    Ok(cells) => columns.task_from(cells).map_err(|err| err.to_string()),
                    Err(reason) => Err(reason.clone()),
                };
                match task {
                    Ok(task) => decoded.tasks.push(task),
                    Err(reason) => decoded.skip(row.line, reason, &row.raw),
                }
            }
            decoded
        }

        fn encode<'a>(&self, tasks: impl IntoIterator<Item = &'a Task>) -> Result<String> {
            let mut out = CSV_HEADER.join(",");
            out.push_str(CSV_LINE_END);
            for task in tasks {
                let category = match &task.category {
                    Some(category) => category.clone(),
                    None => task.priority.to_string(),
                };
                out.push_str(&csv_escape(&task.title));
                out.push(',');
                out.push_str(&task.due.to_iso());
                out.push(',');
                out.push_str(&csv_escape(&category));
                out.push(',');
                out.push_str(task.status.as_csv());
                out.push_str(CSV_LINE_END);
            }
            Ok(out)
        }
    }

    fn csv_escape(value: &str) -> String {
        if value.chars().any(|c| matches!(c, ',' | '"' | '\n' | '\r')) {
            format!("\"{}\"", value.replace('"', "\"\""))
        } else {
            value.to_string()
        }
    }

    /// Column positions resolved from the header row.
    struct Columns {
        title: usize,
        due: usize,
        category: usize,
        status: usize,
    }

    impl Columns {
        fn locate(names: &[String]) -> std::result::Result<Self, String> {
            let find = |wanted: &str| {
                names
                    .iter()
                    .position(|name| name.trim().eq_ignore_ascii_case(wanted))
                    .ok_or_else(|| format!("missing the {wanted:?} column"))
            };
            Ok(Self {
                title: find("title")?,
                due: find("due")?,
                category: find("category")?,
                status: find("status")?,
            })
        }

        fn task_from(&self, cells: &[String]) -> Result<Task> {
            let cell = |index: usize, field: Field| {
                cells
                    .get(index)
                    .map(String::as_str)
                    .ok_or_else(|| TaskError::invalid(field, "row has too few columns"))
            };
            let due: Due = cell(self.due, Field::Due)?.parse()?;
            let category = cell(self.category, Field::Priority)?;
            // Free-text and empty categories are valid here; they map to the
            // default priority and the cell itself is kept for writing back.
            let priority = category.parse::<Priority>().unwrap_or_default();
            let status: Status = cell(self.status, Field::Status)?.parse()?;
            let mut task = Task::with_status(cell(self.title, Field::Title)?, due, priority, status)?;
            if category != priority.to_string() {
                task.category = Some(category.to_string());
            }
            Ok(task)
        }
    }

    mod csv_syntax {
        use nom::{
            IResult,
            branch::alt,
            bytes::complete::{is_not, tag, take_while},
            character::complete::{char, line_ending},
            combinator::{eof, map},
            multi::{fold_many0, separated_list1},
            sequence::{delimited, terminated},
        };

        /// One physical record: the line it starts on and its cells, or why it failed.
        pub struct Row {
            pub line: usize,
            pub raw: String,
            pub fields: Result<Vec<String>, String>,
        }

        impl Row {
            pub fn is_blank(&self) -> bool {
                matches!(&self.fields, Ok(cells) if cells.len() == 1 && cells[0].trim().is_empty())
            }
        }

        type PResult<'a, T> = IResult<&'a str, T>;

        fn quoted(i: &str) -> PResult<'_, String> {
            delimited(
                char('"'),
                fold_many0(
                    alt((
                        map(tag("\"\""), |_: &str| "\"".to_string()),
                        map(is_not("\""), |s: &str| s.to_string()),
                    )),
                    String::new,
                    |mut acc, piece| {
                        acc.push_str(&piece);
                        acc
                    },
                ),
                char('"'),
            )(i)
        }

        fn bare(i: &str) -> PResult<'_, String> {
            map(
                take_while(|c: char| !matches!(c, ',' | '"' | '\n' | '\r')),
                |s: &str| s.to_string(),
            )(i)
        }

        fn record(i: &str) -> PResult<'_, Vec<String>> {
            terminated(
                separated_list1(char(','), alt((quoted, bare))),
                alt((line_ending, eof)),
            )(i)
        }

        /// Split input into records. A record that does not parse is reported
        /// and skipped up to the next line break.
        pub fn rows(input: &str) -> Vec<Row> {
            let mut out = Vec::new();
            let mut rest = input;
            let mut line = 1;
            while !rest.is_empty() {
                match record(rest) {
                    Ok((after, fields)) => {
                        let consumed = &rest[..rest.len() - after.len()];
                        out.push(Row {
                            line,
                            raw: consumed.trim_end_matches(&['\r', '\n'][..]).to_string(),
                            fields: Ok(fields),
                        });
                        line += consumed.matches('\n').count();
                        rest = after;
                    }
                    Err(_) => {
                        let end = rest.find('\n').map_or(rest.len(), |pos| pos + 1);
                        let consumed = &rest[..end];
                        out.push(Row {
                            line,
                            raw: consumed.trim_end_matches(&['\r', '\n'][..]).to_string(),
                            fields: Err("malformed CSV record".to_string()),
                        });
                        line += 1;
                        rest = &rest[end..];
                    }
                }
            }
            out
        }

    }

}

pub mod store {
    use crate::core::{Due, Priority, Result, Status, Task, TaskError, TaskId, validate_title};
    use indexmap::IndexMap;
    use tracing::debug;

    /// Unvalidated input for [`TaskStore::add`]. Empty `due` means no date,
    /// empty `priority` means the default priority.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct NewTask {
        pub title: String,
        pub due: String,
        pub priority: String,
    }

    impl NewTask {
        pub fn new(title: impl Into<String>) -> Self {
            Self {
                title: title.into(),
                ..Self::default()
            }
        }

        pub fn due(mut self, due: impl Into<String>) -> Self {
            self.due = due.into();
            self
        }

        pub fn priority(mut self, priority: impl Into<String>) -> Self {
            self.priority = priority.into();
            self
        }
    }

    /// Partial edit: `None` leaves the field unchanged.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct TaskPatch {
        pub title: Option<String>,
        pub due: Option<String>,
        pub priority: Option<String>,
        pub status: Option<String>,
    }

    impl TaskPatch {
        pub fn is_empty(&self) -> bool {
            self.title.is_none() && self.due.is_none() && self.priority.is_none() && self.status.is_none()
        }
    }

    /// Outcome of [`TaskStore::mark_done`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MarkDone {
        Completed,
        AlreadyDone,
    }

    /// Tasks of one file, in insertion order.
    #[derive(Debug, Clone, Default)]
    pub struct TaskStore {
        tasks: IndexMap<TaskId, Task>,
    }

    impl TaskStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
            Self {
                tasks: tasks.into_iter().map(|task| (task.id, task)).collect(),
            }
        }

        pub fn len(&self) -> usize {
            self.tasks.len()
        }

        pub fn is_empty(&self) -> bool {
            self.tasks.is_empty()
        }

        /// Tasks in storage order.
        pub fn iter(&self) -> impl Iterator<Item = &Task> {
            self.tasks.values()
        }

        pub fn get(&self, id: TaskId) -> Option<&Task> {
            self.tasks.get(&id)
        }

        /// Id of the task at a 0-based storage position.
        pub fn id_at(&self, index: usize) -> Result<TaskId> {
            self.tasks
                .get_index(index)
                .map(|(id, _)| *id)
                .ok_or(TaskError::IndexOutOfRange {
                    index,
                    len: self.tasks.len(),
                })
        }

        pub fn add(&mut self, new: NewTask) -> Result<TaskId> {
            let due: Due = new.due.parse()?;
            let priority = if new.priority.trim().is_empty() {
                Priority::default()
            } else {
                new.priority.parse()?
            };
            let task = Task::new(&new.title, due, priority)?;
            let id = task.id;
            debug!(%id, title = %task.title, "added task");
            self.tasks.insert(id, task);
            Ok(id)
        }

        /// Marking an already finished task is not an error; the caller is told.
        pub fn mark_done(&mut self, id: TaskId) -> Result<MarkDone> {
            let task = self.tasks.get_mut(&id).ok_or(TaskError::UnknownTask(id))?;
            if task.is_done() {
                return Ok(MarkDone::AlreadyDone);
            }
            task.status = Status::Done;
            debug!(%id, "marked task done");
            Ok(MarkDone::Completed)
        }

        pub fn mark_done_at(&mut self, index: usize) -> Result<MarkDone> {
            let id = self.id_at(index)?;
            self.mark_done(id)
        }

        /// Remove a task; later positions shift down by one.
        pub fn delete(&mut self, id: TaskId) -> Result<Task> {
            let task = self.tasks.shift_remove(&id).ok_or(TaskError::UnknownTask(id))?;
            debug!(%id, title = %task.title, "deleted task");
            Ok(task)
        }

        pub fn delete_at(&mut self, index: usize) -> Result<Task> {
            let id = self.id_at(index)?;
            self.delete(id)
        }

        /// Every provided field is validated before any is applied, so a
        /// rejected edit leaves the task exactly as it was.
        pub fn edit(&mut self, id: TaskId, patch: TaskPatch) -> Result<()> {
            if !self.tasks.contains_key(&id) {
                return Err(TaskError::UnknownTask(id));
            }
            let title = patch.title.as_deref().map(validate_title).transpose()?;
            let due = patch.due.as_deref().map(str::parse::<Due>).transpose()?;
            let priority = patch
                .priority
                .as_deref()
                .map(str::parse::<Priority>)
                .transpose()?;
            let status = patch.status.as_deref().map(str::parse::<Status>).transpose()?;

            let task = self.tasks.get_mut(&id).ok_or(TaskError::UnknownTask(id))?;
            if let Some(title) = title {
                task.title = title;
            }
            if let Some(due) = due {
                task.due = due;
            }
            if let Some(priority) = priority {
                task.priority = priority;
                // An explicit priority replaces any free-text CSV category.
                task.category = None;
            }
            if let Some(status) = status {
                task.status = status;
            }
            debug!(%id, "edited task");
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::codec::FileFormat;
        use crate::core::Field;

        fn store_with(titles: &[&str]) -> TaskStore {
            let mut store = TaskStore::new();
            for title in titles {
                store.add(NewTask::new(*title)).expect("add");
            }
            store
        }

        fn titles(store: &TaskStore) -> Vec<&str> {
            store.iter().map(|task| task.title.as_str()).collect()
        }

        #[test]
        fn add_to_empty_store_starts_pending() {
            let mut store = TaskStore::new();
            let id = store
                .add(NewTask::new("Buy milk").due("no date").priority("low"))
                .expect("add");
            assert_eq!(store.len(), 1);
            let task = store.get(id).expect("task");
            assert_eq!(task.status, Status::Pending);
            assert_eq!(task.due, Due::NoDate);
            assert_eq!(task.priority, Priority::Low);
            let encoded = FileFormat::Lines.encode(store.iter()).expect("encode");
            assert_eq!(encoded, "Buy milk|no date|low|pending\n");
        }

        #[test]
        fn add_rejects_invalid_fields() {
            let mut store = TaskStore::new();
            let cases = [
                (NewTask::new(""), Field::Title),
                (NewTask::new("a|b"), Field::Title),
                (NewTask::new("ok").due("30-02-2025"), Field::Due),
                (NewTask::new("ok").priority("urgent"), Field::Priority),
            ];
            for (new, expected) in cases {
                match store.add(new) {
                    Err(TaskError::Validation { field, .. }) => assert_eq!(field, expected),
                    other => panic!("expected validation error, got {other:?}"),
                }
            }
            assert!(store.is_empty());
        }

        #[test]
        fn mark_done_twice_reports_already_done() {
            let mut store = store_with(&["Only"]);
            assert_eq!(store.mark_done_at(0).expect("first"), MarkDone::Completed);
            assert_eq!(store.mark_done_at(0).expect("second"), MarkDone::AlreadyDone);
            assert!(store.iter().all(Task::is_done));
        }

        #[test]
        fn mark_done_out_of_bounds_is_an_index_error() {
            let mut store = store_with(&["Only"]);
            let err = store.mark_done_at(1).unwrap_err();
            assert!(matches!(err, TaskError::IndexOutOfRange { index: 1, len: 1 }));
            assert!(err.is_index_error());
        }

        #[test]
        fn repeated_delete_removes_the_next_task_then_fails() {
            let mut store = store_with(&["a", "b", "c"]);
            assert_eq!(store.delete_at(1).expect("first").title, "b");
            assert_eq!(titles(&store), vec!["a", "c"]);
            assert_eq!(store.delete_at(1).expect("second").title, "c");
            let err = store.delete_at(1).unwrap_err();
            assert!(err.is_index_error());
            assert_eq!(titles(&store), vec!["a"]);
        }

        #[test]
        fn ids_survive_deletion_of_other_tasks() {
            let mut store = store_with(&["a", "b", "c"]);
            let c = store.id_at(2).expect("id");
            store.delete_at(0).expect("delete");
            assert_eq!(store.get(c).expect("still there").title, "c");
            store.delete(c).expect("delete by id");
            assert!(matches!(store.delete(c), Err(TaskError::UnknownTask(_))));
        }

        #[test]
        fn edit_applies_only_provided_fields() {
            let mut store = TaskStore::new();
            let id = store
                .add(NewTask::new("Draft").due("01-03-2025").priority("low"))
                .expect("add");
            store
                .edit(
                    id,
                    TaskPatch {
                        title: Some("Final".into()),
                        status: Some("done".into()),
                        ..TaskPatch::default()
                    },
                )
                .expect("edit");
            let task = store.get(id).expect("task");
            assert_eq!(task.title, "Final");
            assert_eq!(task.status, Status::Done);
            assert_eq!(task.due.to_day_first(), "01-03-2025");
            assert_eq!(task.priority, Priority::Low);
        }

        #[test]
        fn edit_keeps_a_csv_category_until_priority_is_set() {
            let decoded = FileFormat::Csv.decode("title,due,category,status\nRead,,Uni,OPEN\n");
            let mut store = TaskStore::from_tasks(decoded.tasks);
            let id = store.id_at(0).expect("id");
            store
                .edit(id, TaskPatch { title: Some("Read more".into()), ..TaskPatch::default() })
                .expect("edit title");
            assert_eq!(store.get(id).expect("task").category.as_deref(), Some("Uni"));

            store
                .edit(id, TaskPatch { priority: Some("high".into()), ..TaskPatch::default() })
                .expect("edit priority");
            let task = store.get(id).expect("task");
            assert_eq!(task.priority, Priority::High);
            assert_eq!(task.category, None);
        }

        #[test]
        fn edit_can_clear_the_due_date() {
            let mut store = TaskStore::new();
            let id = store.add(NewTask::new("Dated").due("2025-03-01")).expect("add");
            store
                .edit(
                    id,
                    TaskPatch {
                        due: Some("none".into()),
                        ..TaskPatch::default()
                    },
                )
                .expect("edit");
            assert_eq!(store.get(id).expect("task").due, Due::NoDate);
        }

        #[test]
        fn partially_invalid_edit_changes_nothing() {
            let mut store = TaskStore::new();
            let id = store.add(NewTask::new("Keep me").priority("high")).expect("add");
            let before = store.get(id).cloned().expect("task");
            let err = store
                .edit(
                    id,
                    TaskPatch {
                        title: Some("New title".into()),
                        due: Some("not a date".into()),
                        ..TaskPatch::default()
                    },
                )
                .unwrap_err();
            assert!(matches!(err, TaskError::Validation { field: Field::Due, .. }));
            assert_eq!(store.get(id), Some(&before));
        }

        #[test]
        fn edit_unknown_task_is_an_index_error() {
            let mut store = TaskStore::new();
            let err = store.edit(TaskId::new(), TaskPatch::default()).unwrap_err();
            assert!(err.is_index_error());
        }
    }
}

pub mod query {
    //! Pure orderings and subsets over tasks. Nothing here mutates or copies records.

    use crate::core::{Result, Status, Task, TaskError, TaskId};

    /// Stable ascending sort by due date; undated tasks go last.
    pub fn sort_by_due<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Vec<&'a Task> {
        let mut sorted: Vec<&Task> = tasks.into_iter().collect();
        // `sort_by_key` is stable, so equal due dates keep their input order.
        sorted.sort_by_key(|task| task.due);
        sorted
    }

    /// Tasks with `status`, in input order, and how many there are.
    pub fn filter_by_status<'a>(
        tasks: impl IntoIterator<Item = &'a Task>,
        status: Status,
    ) -> (Vec<&'a Task>, usize) {
        let matching: Vec<&Task> = tasks.into_iter().filter(|task| task.status == status).collect();
        let count = matching.len();
        (matching, count)
    }

    /// The numbered view shown to the user: optionally filtered, then sorted by due date.
    pub fn listing<'a>(tasks: impl IntoIterator<Item = &'a Task>, status: Option<Status>) -> Vec<&'a Task> {
        match status {
            Some(status) => sort_by_due(filter_by_status(tasks, status).0),
            None => sort_by_due(tasks),
        }
    }

    /// Translate a 1-based number from a listing into the task's id.
    pub fn resolve_position(listing: &[&Task], number: usize) -> Result<TaskId> {
        number
            .checked_sub(1)
            .and_then(|index| listing.get(index))
            .map(|task| task.id)
            .ok_or(TaskError::NumberOutOfRange {
                number,
                len: listing.len(),
            })
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{Due, Priority};

        fn task(title: &str, due: &str) -> Task {
            Task::new(title, due.parse::<Due>().unwrap(), Priority::Medium).unwrap()
        }

        fn titles(tasks: &[&Task]) -> Vec<String> {
            tasks.iter().map(|task| task.title.clone()).collect()
        }

        #[test]
        fn earlier_due_date_comes_first() {
            let tasks = [task("later", "2025-01-10"), task("sooner", "2025-01-05")];
            assert_eq!(titles(&sort_by_due(&tasks)), vec!["sooner", "later"]);
        }

        #[test]
        fn undated_tasks_sort_after_all_dated_ones() {
            let tasks = [
                task("undated 1", "no date"),
                task("far future", "31-12-9999"),
                task("undated 2", ""),
                task("soon", "01-01-2025"),
            ];
            assert_eq!(
                titles(&sort_by_due(&tasks)),
                vec!["soon", "far future", "undated 1", "undated 2"]
            );
        }

        #[test]
        fn equal_due_dates_keep_input_order() {
            let tasks = [
                task("b", "2025-02-01"),
                task("x", "2025-01-01"),
                task("a", "2025-02-01"),
                task("c", "2025-02-01"),
            ];
            assert_eq!(titles(&sort_by_due(&tasks)), vec!["x", "b", "a", "c"]);
        }

        #[test]
        fn filter_returns_matches_in_order_with_count() {
            let mut tasks = vec![task("one", ""), task("two", ""), task("three", "")];
            tasks[0].status = Status::Done;
            tasks[2].status = Status::Done;
            let (done, count) = filter_by_status(&tasks, Status::Done);
            assert_eq!(titles(&done), vec!["one", "three"]);
            assert_eq!(count, done.len());
            assert!(done.iter().all(|task| task.status == Status::Done));
        }

        #[test]
        fn filter_with_no_matches_is_empty() {
            let tasks = [task("one", "")];
            let (done, count) = filter_by_status(&tasks, Status::Done);
            assert!(done.is_empty());
            assert_eq!(count, 0);
        }

        #[test]
        fn numbers_resolve_against_the_displayed_listing() {
            let mut tasks = vec![task("late", "2025-03-01"), task("early", "2025-01-01"), task("mid", "2025-02-01")];
            tasks[1].status = Status::Done;
            let all = listing(&tasks, None);
            assert_eq!(resolve_position(&all, 1).unwrap(), tasks[1].id);
            let pending = listing(&tasks, Some(Status::Pending));
            assert_eq!(resolve_position(&pending, 1).unwrap(), tasks[2].id);
            assert!(matches!(
                resolve_position(&pending, 3),
                Err(TaskError::NumberOutOfRange { number: 3, len: 2 })
            ));
            assert!(resolve_position(&pending, 0).unwrap_err().is_index_error());
        }
    }
}

pub use codec::{CsvCodec, FileFormat, LineCodec, Warning};
pub use crate::core::{Due, Priority, Status, Task, TaskError, TaskId};
pub use storage::{Loaded, TaskCodec, load, save};
pub use store::{MarkDone, NewTask, TaskPatch, TaskStore};
