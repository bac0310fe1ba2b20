use std::fs;
use std::thread::sleep;
use std::time::Duration;

use tempfile::TempDir;

use reelsmith_core::channel::{discover_channels, ensure_template, init_channel, ChannelError};
use reelsmith_core::pairing::{complete_pairs, find_pair, pair_is_complete};

#[test]
fn completeness_depends_only_on_directory_contents() {
    let dir = TempDir::new().unwrap();
    let scripts = dir.path();
    assert!(!pair_is_complete(scripts, "ABC"));

    fs::write(scripts.join("ABC_hook.txt"), "hook").unwrap();
    assert!(!pair_is_complete(scripts, "ABC"));
    assert!(!pair_is_complete(scripts, "ABC"));

    fs::write(scripts.join("ABC_KB.txt"), "kb").unwrap();
    assert!(pair_is_complete(scripts, "ABC"));
    assert!(pair_is_complete(scripts, "abc"));

    let pair = find_pair(scripts, "abc").unwrap();
    assert_eq!(pair.prefix, "ABC");
    assert_eq!(pair.kb, scripts.join("ABC_KB.txt"));

    fs::remove_file(scripts.join("ABC_hook.txt")).unwrap();
    assert!(!pair_is_complete(scripts, "ABC"));
}

#[test]
fn unrelated_files_never_complete_a_pair() {
    let dir = TempDir::new().unwrap();
    let scripts = dir.path();
    fs::write(scripts.join("ABC_hook.txt"), "hook").unwrap();
    fs::write(scripts.join("ABC_kb.md"), "kb").unwrap();
    fs::write(scripts.join("ABCD_kb.txt"), "kb").unwrap();
    fs::create_dir(scripts.join("ABC_kb.txt")).unwrap();
    assert!(!pair_is_complete(scripts, "ABC"));
}

#[test]
fn complete_pairs_are_ordered_by_arrival() {
    let dir = TempDir::new().unwrap();
    let scripts = dir.path();
    fs::write(scripts.join("ZED_hook.txt"), "hook").unwrap();
    fs::write(scripts.join("ZED_kb.txt"), "kb").unwrap();
    sleep(Duration::from_millis(20));
    fs::write(scripts.join("AAA_hook.txt"), "hook").unwrap();
    fs::write(scripts.join("AAA_kb.txt"), "kb").unwrap();
    fs::write(scripts.join("LONE_kb.txt"), "kb").unwrap();

    let prefixes: Vec<String> = complete_pairs(scripts)
        .into_iter()
        .map(|pair| pair.prefix)
        .collect();
    assert_eq!(prefixes, vec!["ZED".to_string(), "AAA".to_string()]);
}

#[test]
fn missing_scripts_dir_has_no_pairs() {
    let dir = TempDir::new().unwrap();
    assert!(complete_pairs(&dir.path().join("absent")).is_empty());
}

#[test]
fn init_channel_seeds_documents_and_assets() {
    let dir = TempDir::new().unwrap();
    let template = ensure_template(dir.path()).unwrap();
    assert!(template.config_file.is_file());

    let paths = init_channel(dir.path(), "news").unwrap();
    paths.validate().unwrap();
    assert!(paths.require_overlay1().is_ok());
    assert!(paths.overlay2_dir.join("overlay2.png").is_file());
    let documents = paths.load_documents().unwrap();
    assert_eq!(documents.preset_name(), "1");

    fs::write(&paths.config_file, r#"{"voice_settings":{"language":"pt"}}"#).unwrap();
    init_channel(dir.path(), "news").unwrap();
    let documents = paths.load_documents().unwrap();
    assert_eq!(documents.config.voice_settings.language.as_deref(), Some("pt"));
    assert_eq!(documents.voice_settings().language.as_deref(), Some("en"));

    for bad in ["", "_hidden", ".dot", "a/b"] {
        assert!(matches!(
            init_channel(dir.path(), bad),
            Err(ChannelError::InvalidName(_))
        ));
    }
}

#[test]
fn discovery_skips_reserved_entries() {
    let dir = TempDir::new().unwrap();
    init_channel(dir.path(), "sports").unwrap();
    init_channel(dir.path(), "news").unwrap();
    fs::create_dir_all(dir.path().join("_logs")).unwrap();
    fs::create_dir_all(dir.path().join(".cache")).unwrap();
    fs::write(dir.path().join("notes.txt"), "not a channel").unwrap();

    let names: Vec<String> = discover_channels(dir.path())
        .unwrap()
        .into_iter()
        .map(|paths| paths.name)
        .collect();
    assert_eq!(names, vec!["news".to_string(), "sports".to_string()]);
}
