use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptMarker {
    Hook,
    Kb,
}

impl ScriptMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptMarker::Hook => "hook",
            ScriptMarker::Kb => "kb",
        }
    }
}

/// A complete hook/kb pair sitting in a channel's `Scripts/` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPair {
    pub prefix: String,
    pub hook: PathBuf,
    pub kb: PathBuf,
}

/// Text before the first `_` of the file stem, or the whole stem.
pub fn prefix_of(file_name: &str) -> String {
    let stem = match file_name.rfind('.') {
        Some(0) | None => file_name,
        Some(index) => &file_name[..index],
    };
    match stem.find('_') {
        Some(index) => stem[..index].to_string(),
        None => stem.to_string(),
    }
}

pub fn marker_of(file_name: &str) -> Option<ScriptMarker> {
    let lowered = file_name.to_ascii_lowercase();
    if lowered.ends_with("_hook.txt") {
        Some(ScriptMarker::Hook)
    } else if lowered.ends_with("_kb.txt") {
        Some(ScriptMarker::Kb)
    } else {
        None
    }
}

/// Marker and prefix of a script file, if it is one.
pub fn classify(path: &Path) -> Option<(ScriptMarker, String)> {
    let name = path.file_name()?.to_str()?;
    let marker = marker_of(name)?;
    Some((marker, prefix_of(name)))
}

pub fn pair_is_complete(scripts_dir: &Path, prefix: &str) -> bool {
    find_pair(scripts_dir, prefix).is_some()
}

/// Both files of `prefix`. The returned prefix is spelled as in the hook file
/// name so that events for either file agree on it.
pub fn find_pair(scripts_dir: &Path, prefix: &str) -> Option<ScriptPair> {
    let mut hook = None;
    let mut kb = None;
    for path in script_files(scripts_dir) {
        let Some((marker, candidate)) = classify(&path) else {
            continue;
        };
        if !candidate.eq_ignore_ascii_case(prefix) {
            continue;
        }
        let slot = match marker {
            ScriptMarker::Hook => &mut hook,
            ScriptMarker::Kb => &mut kb,
        };
        if slot.is_none() {
            *slot = Some(path);
        }
    }
    match (hook, kb) {
        (Some(hook), Some(kb)) => {
            let prefix = hook
                .file_name()
                .and_then(|name| name.to_str())
                .map(prefix_of)
                .unwrap_or_else(|| prefix.to_string());
            Some(ScriptPair { prefix, hook, kb })
        }
        _ => {
            debug!(prefix, dir = %scripts_dir.display(), "waiting for pair");
            None
        }
    }
}

/// Every complete pair in `scripts_dir`, oldest arrival first. A pair arrives
/// when the later of its two files does.
pub fn complete_pairs(scripts_dir: &Path) -> Vec<ScriptPair> {
    let mut prefixes: Vec<String> = Vec::new();
    for path in script_files(scripts_dir) {
        if let Some((_, prefix)) = classify(&path) {
            if !prefixes
                .iter()
                .any(|known| known.eq_ignore_ascii_case(&prefix))
            {
                prefixes.push(prefix);
            }
        }
    }
    let mut pairs: Vec<(SystemTime, ScriptPair)> = prefixes
        .iter()
        .filter_map(|prefix| find_pair(scripts_dir, prefix))
        .map(|pair| {
            let arrived = modified(&pair.hook).max(modified(&pair.kb));
            (arrived, pair)
        })
        .collect();
    pairs.sort_by(|left, right| {
        left.0
            .cmp(&right.0)
            .then_with(|| left.1.prefix.cmp(&right.1.prefix))
    });
    pairs.into_iter().map(|(_, pair)| pair).collect()
}

fn modified(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn script_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_text_before_first_underscore() {
        assert_eq!(prefix_of("ABC_hook.txt"), "ABC");
        assert_eq!(prefix_of("ABC_part_2_KB.txt"), "ABC");
        assert_eq!(prefix_of("abc.txt"), "abc");
        assert_eq!(prefix_of("Mixed_Case_hook.txt"), "Mixed");
    }

    #[test]
    fn markers_are_case_insensitive() {
        assert_eq!(marker_of("ABC_hook.txt"), Some(ScriptMarker::Hook));
        assert_eq!(marker_of("ABC_Hook.txt"), Some(ScriptMarker::Hook));
        assert_eq!(marker_of("ABC_KB.txt"), Some(ScriptMarker::Kb));
        assert_eq!(marker_of("ABC_Kb.txt"), Some(ScriptMarker::Kb));
        assert_eq!(marker_of("ABC_kb.md"), None);
        assert_eq!(marker_of("ABC_notes.txt"), None);
        assert_eq!(marker_of("ABChook.txt"), None);
    }
}
