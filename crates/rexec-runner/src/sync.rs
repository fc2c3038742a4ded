use std::path::{Component, Path, PathBuf};

use crate::config::SyncConfig;

pub fn build_sync_command(
    sync: &SyncConfig,
    ssh: &str,
    remote_user: &str,
    hostname: &str,
) -> String {
    let src = normalize_path(&sync.src);
    let include = relative_to(&src, &sync.include_file);
    let exclude = relative_to(&src, &sync.exclude_file);
    format!(
        "rsync -r -e '{}' --exclude-from={} --files-from={} --progress -uva {}/ {}@{}:{}",
        ssh,
        exclude.display(),
        include.display(),
        src.display(),
        remote_user,
        hostname,
        sync.dest
    )
}

pub fn build_fetch_command(
    ssh: &str,
    remote_user: &str,
    hostname: &str,
    remote_dir: &str,
    dest: &Path,
) -> String {
    format!(
        "rsync -e '{}' --progress -uva {}@{}:{}/ {}/",
        ssh,
        remote_user,
        hostname,
        normalize_path(Path::new(remote_dir)).display(),
        dest.display()
    )
}

fn relative_to(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&root.join(path))
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
