// crates/tapecut-core/src/task.rs
//
// ExportTask: one requested trim export.
//
// Identity (id, source, range, linked record) is fixed at construction. Only
// the output name and the run status change, and the name only while the
// task is still Pending. Clones share the status cell, so a front-end can keep
// a clone and poll it after the queue has dropped its own copy.
//
// State machine:
//   Pending → Running → Succeeded
//                     ↘ Failed
// Terminal states are final. Nothing retries automatically.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Extension every export is normalized to.
pub const OUTPUT_EXTENSION: &str = "mp4";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

/// The external record a task was created for (a tape / conversion entry).
/// The engine only reads `note` to derive a file name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedRecord {
    pub name: String,
    pub note: String,
}

/// How `ExportTask::from_record` picks the output file name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamingMode {
    /// Use the source file's stem.
    #[default]
    FromSource,
    /// Use the linked record's note, falling back to the source stem when blank.
    FromNote,
}

#[derive(Debug, Default)]
struct TaskStatus {
    state:   TaskState,
    failure: Option<String>,
    output:  Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct ExportTask {
    id:          Uuid,
    source:      PathBuf,
    output_name: String,
    start:       f64,
    end:         f64,
    linked:      Option<LinkedRecord>,
    status:      Arc<Mutex<TaskStatus>>,
}

impl ExportTask {
    /// Build a task. Rejects `start >= end`, negative or non-finite bounds,
    /// and output names that cannot be a plain file name.
    pub fn new(
        source:      impl Into<PathBuf>,
        output_name: impl Into<String>,
        start:       f64,
        end:         f64,
        linked:      Option<LinkedRecord>,
    ) -> Result<Self> {
        validate_range(start, end)?;
        let output_name = output_name.into();
        normalize_output_name(&output_name)?;
        Ok(Self {
            id: Uuid::new_v4(),
            source: source.into(),
            output_name,
            start,
            end,
            linked,
            status: Arc::default(),
        })
    }

    /// Build a task for `record`, naming the output per `naming`.
    pub fn from_record(
        source: impl Into<PathBuf>,
        start:  f64,
        end:    f64,
        record: LinkedRecord,
        naming: NamingMode,
    ) -> Result<Self> {
        let source = source.into();
        let name = match naming {
            NamingMode::FromNote if !sanitize_file_name(&record.note).is_empty() => {
                sanitize_file_name(&record.note)
            }
            _ => source_stem(&source)?,
        };
        Self::new(source, name, start, end, Some(record))
    }

    /// Build a task from a batch-file entry.
    pub fn from_entry(entry: &BatchEntry) -> Result<Self> {
        let record = match (&entry.record_name, &entry.record_note) {
            (None, None) => None,
            (name, note) => Some(LinkedRecord {
                name: name.clone().unwrap_or_default(),
                note: note.clone().unwrap_or_default(),
            }),
        };
        match (&entry.output_name, record) {
            (Some(name), record) => Self::new(&entry.source, name.clone(), entry.start, entry.end, record),
            (None, Some(record)) => Self::from_record(&entry.source, entry.start, entry.end, record, entry.naming),
            (None, None) => {
                let name = source_stem(&entry.source)?;
                Self::new(&entry.source, name, entry.start, entry.end, None)
            }
        }
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn source(&self) -> &Path { &self.source }
    pub fn output_name(&self) -> &str { &self.output_name }
    pub fn start(&self) -> f64 { self.start }
    pub fn end(&self) -> f64 { self.end }
    pub fn duration(&self) -> f64 { self.end - self.start }
    pub fn linked(&self) -> Option<&LinkedRecord> { self.linked.as_ref() }

    /// Output name with the canonical extension applied.
    pub fn normalized_output_name(&self) -> String {
        // Validated at construction and on every rename.
        normalize_output_name(&self.output_name).unwrap_or_else(|_| self.output_name.clone())
    }

    /// Replace the output name. Refused for blank or path-like names and once
    /// the task has left Pending.
    pub fn rename(&mut self, new_name: impl Into<String>) -> bool {
        let new_name = new_name.into();
        if !self.is_pending() || normalize_output_name(&new_name).is_err() {
            return false;
        }
        self.output_name = new_name;
        true
    }

    pub fn state(&self) -> TaskState { self.status.lock().state }
    pub fn is_pending(&self) -> bool { self.state() == TaskState::Pending }
    pub fn is_failed(&self) -> bool { self.state() == TaskState::Failed }
    pub fn is_succeeded(&self) -> bool { self.state() == TaskState::Succeeded }

    /// Reason recorded when the task failed.
    pub fn failure(&self) -> Option<String> { self.status.lock().failure.clone() }

    /// Path of the finished file, once succeeded.
    pub fn output_path(&self) -> Option<PathBuf> { self.status.lock().output.clone() }

    /// Pending → Running.
    pub fn begin(&self) -> Result<()> {
        self.transition(TaskState::Running, |_| {})
    }

    /// Running → Succeeded.
    pub fn succeed(&self, output: PathBuf) -> Result<()> {
        self.transition(TaskState::Succeeded, |s| s.output = Some(output))
    }

    /// Running → Failed.
    pub fn fail(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.transition(TaskState::Failed, |s| s.failure = Some(reason))
    }

    fn transition(&self, to: TaskState, apply: impl FnOnce(&mut TaskStatus)) -> Result<()> {
        let mut status = self.status.lock();
        let allowed = matches!(
            (status.state, to),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Running, TaskState::Succeeded)
                | (TaskState::Running, TaskState::Failed)
        );
        if !allowed {
            return Err(EngineError::InvalidTransition { from: status.state, to });
        }
        status.state = to;
        apply(&mut status);
        Ok(())
    }
}

impl fmt::Display for ExportTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExportTask: {} ({}s - {}s) -- {}",
            self.output_name,
            self.start,
            self.end,
            self.source.display(),
        )
    }
}

/// One entry of a batch file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub source:      PathBuf,
    pub start:       f64,
    pub end:         f64,
    #[serde(default)]
    pub output_name: Option<String>,
    #[serde(default)]
    pub record_name: Option<String>,
    #[serde(default)]
    pub record_note: Option<String>,
    #[serde(default)]
    pub naming:      NamingMode,
}

/// Batch file layout: `[[task]]` tables.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    #[serde(default, rename = "task")]
    pub tasks: Vec<BatchEntry>,
}

pub fn validate_range(start: f64, end: f64) -> Result<()> {
    if !start.is_finite() || !end.is_finite() || start < 0.0 || start >= end {
        return Err(EngineError::InvalidRange { start, end });
    }
    Ok(())
}

/// Apply the `.mp4` rule: names already ending in `.mp4` (any case) are kept,
/// everything else gets `.mp4` appended. Blank and path-like names are errors.
///
/// ```
/// use tapecut_core::task::normalize_output_name;
/// assert_eq!(normalize_output_name("Tape 3").unwrap(), "Tape 3.mp4");
/// assert_eq!(normalize_output_name("tape.MP4").unwrap(), "tape.MP4");
/// assert_eq!(normalize_output_name("tape.avi").unwrap(), "tape.avi.mp4");
/// assert!(normalize_output_name("  ").is_err());
/// ```
pub fn normalize_output_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\'])
    {
        return Err(EngineError::InvalidOutputName(name.to_string()));
    }
    let suffix = format!(".{OUTPUT_EXTENSION}");
    if trimmed.to_ascii_lowercase().ends_with(&suffix) {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{trimmed}{suffix}"))
    }
}

/// Apply the `.mp4` rule to the file-name component of a full path.
pub fn normalize_output_path(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| EngineError::InvalidOutputName(path.display().to_string()))?;
    Ok(path.with_file_name(normalize_output_name(name)?))
}

/// Make free text (e.g. a record note) usable as a file name.
///
/// ```
/// use tapecut_core::task::sanitize_file_name;
/// assert_eq!(sanitize_file_name(" Smith: Xmas 1994/95 "), "Smith_ Xmas 1994_95");
/// ```
pub fn sanitize_file_name(text: &str) -> String {
    let cleaned: String = text
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned.trim_end_matches('.').trim().to_string()
}

fn source_stem(source: &Path) -> Result<String> {
    source
        .file_stem()
        .and_then(|s| s.to_str())
        .map(sanitize_file_name)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::InvalidOutputName(source.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> ExportTask {
        ExportTask::new("/tapes/vhs-07.avi", "vhs-07", 30.0, 45.0, None).unwrap()
    }

    #[test]
    fn rejects_empty_and_inverted_ranges() {
        for (s, e) in [(10.0, 10.0), (10.0, 5.0), (-1.0, 5.0), (0.0, f64::NAN)] {
            let err = ExportTask::new("a.avi", "a", s, e, None).unwrap_err();
            assert!(matches!(err, EngineError::InvalidRange { .. }), "{s}..{e}");
        }
    }

    #[test]
    fn normalizes_extension_once() {
        let t = task();
        assert_eq!(t.normalized_output_name(), "vhs-07.mp4");
        let t = ExportTask::new("a.avi", "clip.Mp4", 0.0, 1.0, None).unwrap();
        assert_eq!(t.normalized_output_name(), "clip.Mp4");
    }

    #[test]
    fn path_like_names_are_rejected() {
        assert!(normalize_output_name("../escape").is_err());
        assert!(normalize_output_name("a\\b").is_err());
        assert!(normalize_output_name("..").is_err());
    }

    #[test]
    fn normalize_output_path_rewrites_file_name_only() {
        let p = normalize_output_path(Path::new("/exports/Tape 1")).unwrap();
        assert_eq!(p, PathBuf::from("/exports/Tape 1.mp4"));
    }

    #[test]
    fn state_machine_happy_path() {
        let t = task();
        assert_eq!(t.state(), TaskState::Pending);
        t.begin().unwrap();
        assert_eq!(t.state(), TaskState::Running);
        t.succeed(PathBuf::from("/out/vhs-07.mp4")).unwrap();
        assert!(t.is_succeeded());
        assert_eq!(t.output_path(), Some(PathBuf::from("/out/vhs-07.mp4")));
    }

    #[test]
    fn terminal_states_are_final() {
        let t = task();
        t.begin().unwrap();
        t.fail("decoder exploded").unwrap();
        assert!(t.is_failed());
        assert_eq!(t.failure().as_deref(), Some("decoder exploded"));
        assert!(matches!(t.begin(), Err(EngineError::InvalidTransition { .. })));
        assert!(t.succeed(PathBuf::from("x")).is_err());
    }

    #[test]
    fn cannot_finish_without_running() {
        let t = task();
        let err = t.succeed(PathBuf::from("x")).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { from: TaskState::Pending, to: TaskState::Succeeded }
        ));
    }

    #[test]
    fn clones_share_status() {
        let t = task();
        let watcher = t.clone();
        t.begin().unwrap();
        assert_eq!(watcher.state(), TaskState::Running);
    }

    #[test]
    fn rename_only_while_pending() {
        let mut t = task();
        assert!(!t.rename(""));
        assert!(t.rename("Grandma 80th"));
        assert_eq!(t.normalized_output_name(), "Grandma 80th.mp4");
        t.begin().unwrap();
        assert!(!t.rename("too late"));
        assert_eq!(t.output_name(), "Grandma 80th");
    }

    #[test]
    fn from_record_uses_note_when_asked() {
        let rec = LinkedRecord { name: "Tape 12".into(), note: "Beach trip: 1989".into() };
        let t = ExportTask::from_record("/tapes/cap0012.avi", 0.0, 60.0, rec.clone(), NamingMode::FromNote)
            .unwrap();
        assert_eq!(t.normalized_output_name(), "Beach trip_ 1989.mp4");
        assert_eq!(t.linked(), Some(&rec));

        let t = ExportTask::from_record("/tapes/cap0012.avi", 0.0, 60.0, rec, NamingMode::FromSource)
            .unwrap();
        assert_eq!(t.normalized_output_name(), "cap0012.mp4");
    }

    #[test]
    fn blank_note_falls_back_to_source() {
        let rec = LinkedRecord { name: "Tape 12".into(), note: "   ".into() };
        let t = ExportTask::from_record("/tapes/cap0012.avi", 0.0, 1.0, rec, NamingMode::FromNote).unwrap();
        assert_eq!(t.output_name(), "cap0012");
    }

    #[test]
    fn task_list_parses_from_toml() {
        let list: TaskList = toml::from_str(
            r#"
            [[task]]
            source = "/tapes/a.avi"
            start = 1.0
            end = 2.5

            [[task]]
            source = "/tapes/b.avi"
            start = 0.0
            end = 10.0
            record_note = "Wedding"
            naming = "FromNote"
            "#,
        )
        .unwrap();
        assert_eq!(list.tasks.len(), 2);
        let a = ExportTask::from_entry(&list.tasks[0]).unwrap();
        assert_eq!(a.normalized_output_name(), "a.mp4");
        let b = ExportTask::from_entry(&list.tasks[1]).unwrap();
        assert_eq!(b.normalized_output_name(), "Wedding.mp4");
    }

    #[test]
    fn display_matches_log_format() {
        assert_eq!(task().to_string(), "ExportTask: vhs-07 (30s - 45s) -- /tapes/vhs-07.avi");
    }
}
