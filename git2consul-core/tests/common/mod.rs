//! Git fixtures shared by the integration tests.
#![allow(dead_code)]

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use git2::{Commit, Oid, Repository, RepositoryInitOptions, Signature, Time};

/// Reference instant the fixtures' commit times are expressed against.
pub const T: i64 = 1_700_000_000;

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).expect("valid timestamp")
}

/// A non-bare repository whose HEAD starts unborn on `master`.
pub fn init_repo(path: &Path) -> Repository {
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("master");
    Repository::init_opts(path, &opts).expect("init fixture repository")
}

/// Writes (`Some`) or removes (`None`) each path, stages it and commits on HEAD with
/// author and committer time `time`.
pub fn commit(repo: &Repository, changes: &[(&str, Option<&str>)], message: &str, time: i64) -> Oid {
    let workdir = repo.workdir().expect("fixture has a workdir").to_path_buf();
    let mut index = repo.index().unwrap();
    for (path, content) in changes {
        let full = workdir.join(path);
        match content {
            Some(content) => {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent).unwrap();
                }
                fs::write(&full, content).unwrap();
                index.add_path(Path::new(path)).unwrap();
            }
            None => {
                fs::remove_file(&full).unwrap();
                index.remove_path(Path::new(path)).unwrap();
            }
        }
    }
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = Signature::new("Fixture", "fixture@example.com", &Time::new(time, 0)).unwrap();
    let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
    let parents: Vec<&Commit<'_>> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap()
}

/// Upstream path as a clone URL.
pub fn url_of(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
