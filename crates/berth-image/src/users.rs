//! `/etc/passwd` and `/etc/group` editing for `!CreateUser`.

use std::fs;
use std::io::Write;
use std::path::Path;

use berth_common::paths::resolve_inside;
use berth_common::{BuildError, BuildResult};
use berth_manifest::UserStep;

/// One colon-separated database entry: name and numeric id.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    name: String,
    id: u32,
}

fn read_entries(path: &Path) -> BuildResult<Vec<Entry>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?;
            let id = fields.nth(1)?.parse().ok()?;
            Some(Entry {
                name: name.to_string(),
                id,
            })
        })
        .collect())
}

/// Whether an entry must be added, given the existing ones.
///
/// Same name and id is already present; any partial match is a conflict.
fn check(entries: &[Entry], name: &str, id: u32, kind: &str) -> BuildResult<bool> {
    for entry in entries {
        match (entry.name == name, entry.id == id) {
            (true, true) => return Ok(false),
            (true, false) => {
                return Err(BuildError::UserConflict {
                    user: name.to_string(),
                    reason: format!("{kind} {name} already exists with id {}", entry.id),
                });
            }
            (false, true) => {
                return Err(BuildError::UserConflict {
                    user: name.to_string(),
                    reason: format!("{kind} id {id} is already taken by {}", entry.name),
                });
            }
            (false, false) => {}
        }
    }
    Ok(true)
}

fn append_line(path: &Path, line: &str) -> BuildResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let needs_newline = fs::read(path)
        .map(|content| content.last().is_some_and(|b| *b != b'\n'))
        .unwrap_or(false);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    if needs_newline {
        file.write_all(b"\n")?;
    }
    writeln!(file, "{line}")?;
    Ok(())
}

/// Add the user and its primary group to the image under `root`.
///
/// Re-adding an identical user is a no-op.
///
/// # Errors
///
/// Returns [`BuildError::UserConflict`] when the name or an id is already used
/// differently, or [`BuildError::PathConflict`] when the home path is not a directory.
pub fn create_user(root: &Path, user: &UserStep) -> BuildResult<()> {
    let passwd = resolve_inside(root, Path::new("/etc/passwd"), true)?;
    let group = resolve_inside(root, Path::new("/etc/group"), true)?;
    let group_name = user.group_name();

    let add_group = check(&read_entries(&group)?, group_name, user.gid, "group")?;
    let add_user = check(&read_entries(&passwd)?, &user.name, user.uid, "user")?;

    let home = user.home_dir();
    if add_group {
        append_line(&group, &format!("{group_name}:x:{}:", user.gid))?;
    }
    if add_user {
        append_line(
            &passwd,
            &format!(
                "{}:x:{}:{}::{}:{}",
                user.name,
                user.uid,
                user.gid,
                home.display(),
                user.shell
            ),
        )?;
        let shadow = resolve_inside(root, Path::new("/etc/shadow"), true)?;
        if shadow.exists() {
            append_line(&shadow, &format!("{}:!::0:99999:7:::", user.name))?;
        }
    }

    let host_home = resolve_inside(root, &home, true)?;
    if host_home.exists() && !host_home.is_dir() {
        return Err(BuildError::PathConflict {
            path: home,
            reason: "home directory path is not a directory".to_string(),
        });
    }
    fs::create_dir_all(&host_home)?;
    if rustix::process::geteuid().is_root() {
        std::os::unix::fs::chown(&host_home, Some(user.uid), Some(user.gid))?;
    }

    tracing::debug!(
        user = %user.name,
        uid = user.uid,
        gid = user.gid,
        new = add_user,
        "User ready"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, uid: u32, gid: u32) -> UserStep {
        UserStep {
            name: name.to_string(),
            uid,
            gid,
            group: None,
            home: None,
            shell: "/bin/sh".to_string(),
        }
    }

    #[test]
    fn writes_passwd_group_and_home() {
        let root = tempfile::tempdir().unwrap();
        create_user(root.path(), &user("postgres", 100, 101)).unwrap();

        let passwd = fs::read_to_string(root.path().join("etc/passwd")).unwrap();
        assert_eq!(passwd, "postgres:x:100:101::/home/postgres:/bin/sh\n");
        let group = fs::read_to_string(root.path().join("etc/group")).unwrap();
        assert_eq!(group, "postgres:x:101:\n");
        assert!(root.path().join("home/postgres").is_dir());
    }

    #[test]
    fn identical_user_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        create_user(root.path(), &user("app", 1000, 1000)).unwrap();
        create_user(root.path(), &user("app", 1000, 1000)).unwrap();

        let passwd = fs::read_to_string(root.path().join("etc/passwd")).unwrap();
        assert_eq!(passwd.lines().count(), 1);
    }

    #[test]
    fn conflicting_ids_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("etc")).unwrap();
        fs::write(
            root.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nnobody:x:65534:65534::/:/sbin/nologin",
        )
        .unwrap();

        let err = create_user(root.path(), &user("root", 1, 1)).unwrap_err();
        assert!(matches!(err, BuildError::UserConflict { .. }));

        let err = create_user(root.path(), &user("web", 65534, 2000)).unwrap_err();
        assert!(err.to_string().contains("taken by nobody"));
    }

    #[test]
    fn shared_group_and_missing_newline() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/group"), "staff:x:50:").unwrap();

        let mut member = user("alice", 1001, 50);
        member.group = Some("staff".to_string());
        create_user(root.path(), &member).unwrap();

        let group = fs::read_to_string(root.path().join("etc/group")).unwrap();
        assert_eq!(group, "staff:x:50:");
        let passwd = fs::read_to_string(root.path().join("etc/passwd")).unwrap();
        assert!(passwd.starts_with("alice:x:1001:50:"));
    }

    #[test]
    fn home_path_occupied_by_file() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("home")).unwrap();
        fs::write(root.path().join("home/bob"), "").unwrap();
        let err = create_user(root.path(), &user("bob", 1002, 1002)).unwrap_err();
        assert!(matches!(err, BuildError::PathConflict { .. }));
    }

    #[test]
    fn home_behind_absolute_symlink_stays_in_root() {
        let root = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(host.path(), root.path().join("home")).unwrap();

        create_user(root.path(), &user("carol", 1003, 1003)).unwrap();
        assert!(!host.path().join("carol").exists());
        let anchored = root.path().join(host.path().strip_prefix("/").unwrap());
        assert!(anchored.join("carol").is_dir());
    }
}
