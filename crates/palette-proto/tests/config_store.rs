use palette_proto::config::{Config, ConfigStore};
use tempfile::TempDir;

fn write(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn open_creates_default_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let store = ConfigStore::open(&path).unwrap();
    assert!(path.exists());
    assert_eq!(store.path(), path.as_path());

    let on_disk = Config::load_from(&path).unwrap();
    assert_eq!(on_disk, Config::default());
}

#[tokio::test]
async fn reload_picks_up_external_edits() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "[general_settings]\nspotify_color_override_enabled = false\n");
    let store = ConfigStore::open(&path).unwrap();

    std::fs::write(
        &path,
        "[general_settings]\nspotify_color_override_enabled = true\nspotify_email = \"a@b.c\"\n",
    )
    .unwrap();
    assert!(!store.snapshot().await.general_settings.spotify_color_override_enabled);

    let mut guard = store.lock().await;
    guard.reload().await.unwrap();
    assert!(guard.config().general_settings.spotify_color_override_enabled);
    assert_eq!(guard.config().general_settings.spotify_email, "a@b.c");
}

#[tokio::test]
async fn commit_keeps_edits_made_by_others() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "[colors]\naccent = [1, 2, 3]\n");
    let store = ConfigStore::open(&path).unwrap();

    // Someone else edits a neighbouring field after we opened the store
    std::fs::write(&path, "[colors]\naccent = [9, 9, 9]\n").unwrap();

    {
        let mut guard = store.lock().await;
        guard.reload().await.unwrap();
        let mut next = guard.config().clone();
        next.apply_spotify_colors(vec![[1, 1, 1], [2, 2, 2], [3, 3, 3]], [4, 4, 4]);
        guard.commit(next).await.unwrap();
    }

    let on_disk = Config::load_from(&path).unwrap();
    assert_eq!(on_disk.colors.spotify_color, Some([4, 4, 4]));
    assert_eq!(on_disk.gradients.spotify_palette.len(), 3);
    assert_eq!(
        on_disk.colors.extra.get("accent"),
        Some(&toml::Value::Array(vec![
            toml::Value::Integer(9),
            toml::Value::Integer(9),
            toml::Value::Integer(9),
        ]))
    );
    assert_eq!(store.snapshot().await, on_disk);
}

#[tokio::test]
async fn reload_error_leaves_memory_untouched() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "[general_settings]\nspotify_email = \"keep@me\"\n");
    let store = ConfigStore::open(&path).unwrap();

    std::fs::write(&path, "this is = = not toml").unwrap();

    let mut guard = store.lock().await;
    assert!(guard.reload().await.is_err());
    assert_eq!(guard.config().general_settings.spotify_email, "keep@me");
}

#[tokio::test]
async fn failed_commit_cleans_up_and_keeps_memory() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "[general_settings]\nspotify_email = \"keep@me\"\n");
    let store = ConfigStore::open(&path).unwrap();

    // A directory where the file was makes the final rename fail
    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir(&path).unwrap();
    std::fs::write(path.join("occupied"), "x").unwrap();

    let mut guard = store.lock().await;
    let mut next = guard.config().clone();
    next.apply_spotify_colors(vec![[1, 1, 1]], [2, 2, 2]);
    assert!(guard.commit(next).await.is_err());

    assert!(!path.with_extension("toml.tmp").exists());
    assert_eq!(guard.config().general_settings.spotify_email, "keep@me");
    assert!(guard.config().colors.spotify_color.is_none());
}
