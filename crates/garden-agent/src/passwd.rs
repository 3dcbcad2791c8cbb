//! User lookup against the container's own `/etc/passwd`.
//!
//! The supervisor cannot rely on NSS inside an arbitrary rootfs, so it reads
//! the flat file directly. Callers may name a user by login name or by
//! numeric uid.

use std::fs;

/// The passwd fields the supervisor needs to spawn a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

/// Look up a user in `/etc/passwd` by name or numeric uid.
pub fn lookup_user(name_or_uid: &str) -> Result<User, String> {
    let contents =
        fs::read_to_string("/etc/passwd").map_err(|e| format!("read /etc/passwd: {}", e))?;

    find_user(&contents, name_or_uid).ok_or_else(|| format!("user {} not found", name_or_uid))
}

/// Scan passwd-format content for an entry whose name or uid field matches.
pub(crate) fn find_user(contents: &str, needle: &str) -> Option<User> {
    for line in contents.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 6 {
            continue;
        }

        if fields[0] != needle && fields[2] != needle {
            continue;
        }

        let uid = match fields[2].parse() {
            Ok(uid) => uid,
            Err(_) => continue,
        };
        let gid = match fields[3].parse() {
            Ok(gid) => gid,
            Err(_) => continue,
        };

        return Some(User {
            name: fields[0].to_string(),
            uid,
            gid,
            home: fields[5].to_string(),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
vcap:x:1000:1000:vcap,,,:/home/vcap:/bin/bash
broken line without fields
";

    #[test]
    fn test_find_user_by_name() {
        let user = find_user(SAMPLE, "vcap").unwrap();
        assert_eq!(user.name, "vcap");
        assert_eq!(user.uid, 1000);
        assert_eq!(user.gid, 1000);
        assert_eq!(user.home, "/home/vcap");
    }

    #[test]
    fn test_find_user_by_uid() {
        let user = find_user(SAMPLE, "0").unwrap();
        assert_eq!(user.name, "root");
        assert_eq!(user.home, "/root");
    }

    #[test]
    fn test_find_user_missing() {
        assert!(find_user(SAMPLE, "nobody").is_none());
    }

    #[test]
    fn test_find_user_skips_malformed_lines() {
        assert!(find_user(SAMPLE, "broken line without fields").is_none());
    }

    #[test]
    fn test_lookup_user_error_names_user() {
        // /etc/passwd exists on any Linux host running these tests.
        let err = lookup_user("garden-test-no-such-user").unwrap_err();
        assert!(err.contains("garden-test-no-such-user"));
    }
}
