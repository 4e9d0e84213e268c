//! Durable, append-only record of a conversation.
//!
//! One block per turn:
//!
//! ```text
//! [Bob / llama3:8b]
//! the generated text
//! ```
//!
//! Writes are best-effort: a failed write is logged and the conversation
//! carries on with the in-memory log intact.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Local;

use crate::orchestrator::Outcome;

const RULE_WIDTH: usize = 60;
const CLOCK_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// One generated utterance by one persona. Immutable once created;
/// `index` is the order of creation, zero-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub index: usize,
    pub speaker: String,
    pub model: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct SpeakerInfo {
    pub name: String,
    pub url: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct TranscriptHeader {
    pub topic: String,
    pub first: SpeakerInfo,
    pub second: SpeakerInfo,
    /// One-line summary of the run settings; omitted from the file when empty.
    pub settings: String,
}

pub struct TranscriptWriter {
    path: PathBuf,
    turns: Vec<Turn>,
    file: Option<BufWriter<File>>,
}

impl TranscriptWriter {
    /// Open the transcript file, creating parent directories, and write the
    /// header.
    pub fn create(path: &Path, header: &TranscriptHeader) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = BufWriter::new(File::create(path)?);

        writeln!(file, "Cross-chat Transcript")?;
        writeln!(file, "{}", "=".repeat(RULE_WIDTH))?;
        writeln!(file)?;
        writeln!(file, "Started: {}", Local::now().format(CLOCK_FORMAT))?;
        for speaker in [&header.first, &header.second] {
            writeln!(
                file,
                "{}: {}  model={}",
                speaker.name, speaker.url, speaker.model
            )?;
        }
        writeln!(file, "Topic: {}", header.topic)?;
        if !header.settings.is_empty() {
            writeln!(file, "Settings: {}", header.settings)?;
        }
        writeln!(file)?;
        file.flush()?;

        Ok(Self {
            path: path.to_owned(),
            turns: Vec::new(),
            file: Some(file),
        })
    }

    /// For tests and front ends that never touch the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            turns: Vec::new(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Record a turn and flush its block to disk, best-effort.
    pub fn append(&mut self, turn: &Turn) {
        self.turns.push(turn.clone());
        if let Some(file) = self.file.as_mut() {
            if let Err(error) = write_block(file, turn) {
                tracing::warn!(
                    path = %self.path.display(),
                    %error,
                    "failed to write turn to transcript"
                );
            }
        }
    }

    /// Write the footer and close the file. Called on every terminal state;
    /// calling it again is a no-op.
    pub fn finalize(&mut self, outcome: &Outcome) {
        let Some(mut file) = self.file.take() else {
            return;
        };
        if let Err(error) = write_footer(&mut file, outcome) {
            tracing::warn!(
                path = %self.path.display(),
                %error,
                "failed to finalize transcript"
            );
        }
    }
}

fn write_block(file: &mut BufWriter<File>, turn: &Turn) -> io::Result<()> {
    writeln!(file, "[{} / {}]", turn.speaker, turn.model)?;
    writeln!(file, "{}\n", turn.text.trim())?;
    file.flush()
}

fn write_footer(file: &mut BufWriter<File>, outcome: &Outcome) -> io::Result<()> {
    writeln!(file, "=== End of conversation ===")?;
    if !matches!(outcome, Outcome::Completed) {
        writeln!(file, "Outcome: {outcome}")?;
    }
    writeln!(file, "Finished: {}", Local::now().format(CLOCK_FORMAT))?;
    file.flush()
}

/// Derive a unique transcript path for this run.
///
/// No path: a timestamped default name in the working directory. A directory:
/// the default name inside it. Anything else: the timestamp is injected before
/// the extension (`.txt` when there is none).
pub fn derive_log_path(
    requested: Option<&Path>,
    first_model: &str,
    second_model: &str,
) -> PathBuf {
    let stamp = Local::now().format(STAMP_FORMAT);
    let default_name = format!(
        "crosschat_{}__{}_{stamp}.txt",
        sanitize_component(first_model),
        sanitize_component(second_model)
    );

    let Some(path) = requested.filter(|path| !path.as_os_str().is_empty()) else {
        return PathBuf::from(default_name);
    };
    if path.is_dir() || path.to_string_lossy().ends_with(['/', '\\']) {
        return path.join(default_name);
    }

    let extension = path
        .extension()
        .map(|extension| format!(".{}", extension.to_string_lossy()))
        .unwrap_or_else(|| ".txt".to_owned());
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "crosschat".to_owned());
    let name = format!("{stem}_{stamp}{extension}");
    match path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

// Model names may carry slashes and tags; keep filenames portable.
fn sanitize_component(model: &str) -> String {
    let replaced: String = model
        .chars()
        .map(|c| match c {
            '/' | '<' | '>' | ':' | '"' | '\\' | '|' | '?' | '*' => '_',
            c => c,
        })
        .collect();
    replaced.trim().trim_matches('.').to_owned()
}

/// Parse a written transcript back into its ordered turns. Indices are
/// assigned by position, matching the order they were appended in.
pub fn read_transcript(path: &Path) -> anyhow::Result<Vec<Turn>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read transcript {}", path.display()))?;

    let mut turns = Vec::new();
    let mut current: Option<(String, String, Vec<&str>)> = None;
    for line in contents.lines() {
        if line.starts_with("=== End of conversation") {
            break;
        }
        if let Some((speaker, model)) = parse_turn_header(line) {
            if let Some(done) = current.take() {
                turns.push(finish_turn(turns.len(), done));
            }
            current = Some((speaker, model, Vec::new()));
            continue;
        }
        if let Some((_, _, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some(done) = current.take() {
        turns.push(finish_turn(turns.len(), done));
    }
    Ok(turns)
}

fn finish_turn(index: usize, (speaker, model, body): (String, String, Vec<&str>)) -> Turn {
    Turn {
        index,
        speaker,
        model,
        text: body.join("\n").trim().to_owned(),
    }
}

fn parse_turn_header(line: &str) -> Option<(String, String)> {
    let inner = line.strip_prefix('[')?.strip_suffix(']')?;
    // Persona names may themselves contain " / "; the model label cannot,
    // so split from the right.
    let (speaker, model) = inner.rsplit_once(" / ")?;
    Some((speaker.to_owned(), model.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> TranscriptHeader {
        TranscriptHeader {
            topic: "tea or coffee".to_owned(),
            first: SpeakerInfo {
                name: "Bob".to_owned(),
                url: "http://left:11434".to_owned(),
                model: "llama3:8b".to_owned(),
            },
            second: SpeakerInfo {
                name: "Jane".to_owned(),
                url: "http://right:11434".to_owned(),
                model: "qwen2:7b".to_owned(),
            },
            settings: "turns=2 temperature=0.7".to_owned(),
        }
    }

    #[test]
    fn round_trips_written_turns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.txt");
        let mut writer = TranscriptWriter::create(&path, &header()).unwrap();

        let turns = vec![
            Turn {
                index: 0,
                speaker: "Bob".to_owned(),
                model: "llama3:8b".to_owned(),
                text: "Tea, obviously.\n\nIt has ceremony.".to_owned(),
            },
            Turn {
                index: 1,
                speaker: "Jane".to_owned(),
                model: "qwen2:7b".to_owned(),
                text: "Coffee keeps ships running.".to_owned(),
            },
        ];
        for turn in &turns {
            writer.append(turn);
        }
        writer.finalize(&Outcome::Completed);

        let read = read_transcript(&path).unwrap();
        assert_eq!(read, turns);
    }

    #[test]
    fn partial_transcript_survives_a_failed_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.txt");
        let mut writer = TranscriptWriter::create(&path, &header()).unwrap();

        let turn = Turn {
            index: 0,
            speaker: "Bob".to_owned(),
            model: "llama3:8b".to_owned(),
            text: "Hello?".to_owned(),
        };
        writer.append(&turn);
        writer.finalize(&Outcome::Failed("the node went away".to_owned()));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("Outcome: failed: the node went away"));
        assert_eq!(read_transcript(&path).unwrap(), vec![turn]);
    }

    #[test]
    fn derives_a_default_name_from_the_models() {
        let path = derive_log_path(None, "meta/llama3:8b", "qwen2:7b");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("crosschat_meta_llama3_8b__qwen2_7b_"));
        assert!(name.ends_with(".txt"));
    }

    #[test]
    fn a_directory_gets_the_default_name_inside_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = derive_log_path(Some(dir.path()), "a", "b");
        assert_eq!(path.parent().unwrap(), dir.path());
        assert!(
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("crosschat_a__b_")
        );
    }

    #[test]
    fn a_file_path_gets_the_stamp_before_its_extension() {
        let path = derive_log_path(Some(Path::new("logs/chat.log")), "a", "b");
        assert_eq!(path.parent().unwrap(), Path::new("logs"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("chat_"));
        assert!(name.ends_with(".log"));

        let bare = derive_log_path(Some(Path::new("chat")), "a", "b");
        let name = bare.to_string_lossy().into_owned();
        assert!(name.starts_with("chat_"));
        assert!(name.ends_with(".txt"));
    }

    #[test]
    fn turn_headers_split_on_the_rightmost_separator() {
        let (speaker, model) = parse_turn_header("[R2 / D2 / llama3:8b]").unwrap();
        assert_eq!(speaker, "R2 / D2");
        assert_eq!(model, "llama3:8b");

        assert!(parse_turn_header("Topic: space elevators").is_none());
        assert!(parse_turn_header("[not a header").is_none());
    }
}
