//! Front-matter codec: `---`-delimited YAML header followed by a markdown
//! body.
//!
//! Serialization writes front-matter keys in declaration order (unknown
//! fields sorted last), so parse -> render of a store-written file is
//! byte-identical.

use thiserror::Error;

use crate::model::Task;

/// Errors raised while encoding or decoding a task file.
#[derive(Debug, Error)]
pub enum FrontMatterError {
    #[error("missing front-matter delimiter")]
    MissingDelimiter,

    #[error("unterminated front-matter block")]
    Unterminated,

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Split raw file content into `(front_matter_yaml, body)`.
///
/// The body is returned with the single blank separator line stripped; all
/// other body bytes are preserved.
pub fn split(content: &str) -> Result<(&str, &str), FrontMatterError> {
    let rest = content
        .strip_prefix("---\n")
        .ok_or(FrontMatterError::MissingDelimiter)?;

    if let Some(end) = rest.find("\n---\n") {
        let yaml = &rest[..end + 1];
        let body = rest[end + 5..].strip_prefix('\n').unwrap_or(&rest[end + 5..]);
        Ok((yaml, body))
    } else if let Some(yaml) = rest.strip_suffix("\n---") {
        Ok((yaml, ""))
    } else {
        Err(FrontMatterError::Unterminated)
    }
}

/// Parse a full task file into a [`Task`].
pub fn parse(content: &str) -> Result<Task, FrontMatterError> {
    let (yaml, body) = split(content)?;
    let mut task: Task = serde_yaml::from_str(yaml)?;
    task.body = body.trim_end_matches('\n').to_string();
    if !task.body.is_empty() {
        task.body.push('\n');
    }
    Ok(task)
}

/// Render a [`Task`] back into file content.
pub fn render(task: &Task) -> Result<String, FrontMatterError> {
    let yaml = serde_yaml::to_string(task)?;
    let mut out = String::with_capacity(yaml.len() + task.body.len() + 16);
    out.push_str("---\n");
    out.push_str(&yaml);
    out.push_str("---\n");
    if !task.body.is_empty() {
        out.push('\n');
        out.push_str(&task.body);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
