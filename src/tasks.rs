// src/tasks.rs

//! Task file handling: turning `<URL> <FILE>` lines into [`TaskUnit`]s.
//!
//! Lines naming the same URL are merged into one task that writes every
//! requested file, so each source is fetched once.

use reqwest::Url;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{TaskError, TaskUnit};

#[derive(Debug, Error)]
pub enum TaskFileError {
    #[error("cannot read task file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("task file maps these file names to different URLs: {}", .0.join(", "))]
    DuplicateTarget(Vec<String>),
    #[error("cannot create output folder {path}: {source}")]
    CreateOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} exists and is not a directory")]
    NotADirectory(PathBuf),
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// One line of a task file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskDescription {
    pub url: Url,
    pub file: String,
}

/// Parses a single line. Returns `None` (after logging) for malformed lines.
pub fn parse_line(line: &str) -> Option<TaskDescription> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let [url, file] = fields.as_slice() else {
        warn!("skipping malformed task line: {line:?}");
        return None;
    };
    let url = match Url::parse(url) {
        Ok(url) => url,
        Err(e) => {
            warn!("skipping task line with invalid URL {url:?}: {e}");
            return None;
        }
    };
    if !is_plain_relative(Path::new(file)) {
        warn!("skipping task line with unsafe file name {file:?}");
        return None;
    }
    Some(TaskDescription {
        url,
        file: (*file).to_string(),
    })
}

/// Parses every non-blank line, dropping malformed and exactly repeated ones.
pub fn parse_lines<'a, I>(lines: I) -> Vec<TaskDescription>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    lines
        .into_iter()
        .filter(|line| !line.trim().is_empty())
        .filter_map(parse_line)
        .filter(|task| seen.insert(task.clone()))
        .collect()
}

/// File names that appear with more than one distinct URL, in first-seen order.
pub fn duplicate_targets(tasks: &[TaskDescription]) -> Vec<String> {
    let mut owner: HashMap<&str, &Url> = HashMap::new();
    let mut duplicates = Vec::new();
    for task in tasks {
        match owner.get(task.file.as_str()) {
            Some(url) if *url != &task.url => {
                if !duplicates.contains(&task.file) {
                    warn!("file name {:?} is mapped to several URLs", task.file);
                    duplicates.push(task.file.clone());
                }
            }
            Some(_) => {}
            None => {
                owner.insert(&task.file, &task.url);
            }
        }
    }
    duplicates
}

/// Reads and validates a task file.
pub async fn read_task_file(path: &Path) -> Result<Vec<TaskDescription>, TaskFileError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| TaskFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let tasks = parse_lines(content.lines());
    let duplicates = duplicate_targets(&tasks);
    if !duplicates.is_empty() {
        return Err(TaskFileError::DuplicateTarget(duplicates));
    }
    info!(path = %path.display(), count = tasks.len(), "task file parsed");
    Ok(tasks)
}

/// Groups descriptions by URL into task units writing under `output_dir`.
///
/// Tasks are returned in the order their URL first appears.
pub fn merge_tasks(
    descriptions: Vec<TaskDescription>,
    output_dir: &Path,
) -> Result<Vec<TaskUnit>, TaskError> {
    let mut index: HashMap<Url, usize> = HashMap::new();
    let mut grouped: Vec<(Url, Vec<PathBuf>)> = Vec::new();

    for task in descriptions {
        let dest = output_dir.join(&task.file);
        match index.get(&task.url) {
            Some(&i) => {
                let files = &mut grouped[i].1;
                if !files.contains(&dest) {
                    files.push(dest);
                }
            }
            None => {
                index.insert(task.url.clone(), grouped.len());
                grouped.push((task.url, vec![dest]));
            }
        }
    }

    grouped
        .into_iter()
        .map(|(url, files)| TaskUnit::new(url, files))
        .collect()
}

/// Creates `path` (and its parents) unless it already is a directory.
pub async fn prepare_output_dir(path: &Path) -> Result<(), TaskFileError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(TaskFileError::NotADirectory(path.to_path_buf())),
        Err(_) => tokio::fs::create_dir_all(path)
            .await
            .map_err(|source| TaskFileError::CreateOutput {
                path: path.to_path_buf(),
                source,
            }),
    }
}

fn is_plain_relative(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    const LINES: [&str; 4] = [
        "http://first.example/link file1",
        "http://second.example/link file2",
        "http://first.example/link file3",
        "http://third.example/link file3",
    ];

    #[test]
    fn parses_lines_into_descriptions() {
        let tasks = parse_lines(LINES);
        assert_eq!(tasks.len(), 4);
        assert_eq!(
            tasks[0],
            TaskDescription {
                url: url("http://first.example/link"),
                file: "file1".into()
            }
        );
    }

    #[test]
    fn skips_malformed_and_repeated_lines() {
        let tasks = parse_lines([
            "",
            "only-one-field",
            "three fields here",
            "not-a-url file",
            "http://a.example/x ../escape",
            "http://a.example/x /abs",
            "http://a.example/x  ok",
            "http://a.example/x ok",
        ]);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].file, "ok");
    }

    #[test]
    fn detects_file_mapped_to_several_urls() {
        let tasks = parse_lines(LINES);
        assert_eq!(duplicate_targets(&tasks), vec!["file3".to_string()]);
        assert!(duplicate_targets(&tasks[..3]).is_empty());
    }

    #[test]
    fn merges_by_url() {
        let tasks = parse_lines(LINES[..3].iter().copied());
        let out = Path::new("download");
        let units = merge_tasks(tasks, out).unwrap();

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].source(), &url("http://first.example/link"));
        assert_eq!(
            units[0].destinations(),
            &[out.join("file1"), out.join("file3")]
        );
        assert_eq!(units[1].destinations(), &[out.join("file2")]);
    }

    #[tokio::test]
    async fn task_file_with_conflicting_targets_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.txt");
        tokio::fs::write(&path, LINES.join("\n")).await.unwrap();

        let err = read_task_file(&path).await.unwrap_err();
        assert!(matches!(err, TaskFileError::DuplicateTarget(ref names) if names == &["file3"]));
    }

    #[tokio::test]
    async fn missing_task_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_task_file(&dir.path().join("none.txt")).await.unwrap_err();
        assert!(matches!(err, TaskFileError::Read { .. }));
    }

    #[tokio::test]
    async fn output_dir_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a").join("b");
        prepare_output_dir(&out).await.unwrap();
        assert!(out.is_dir());
        prepare_output_dir(&out).await.unwrap();

        let file = dir.path().join("file");
        tokio::fs::write(&file, b"x").await.unwrap();
        assert!(matches!(
            prepare_output_dir(&file).await,
            Err(TaskFileError::NotADirectory(_))
        ));
    }
}
