//! Canonical remote path helpers. Keys are case-sensitive, always start with
//! `/`, and never end with `/` except for the root.

pub fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty() && *s != ".").collect();
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

/// Parent of a canonical path; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(n) => Some(&path[..n]),
        None => None,
    }
}

pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(n) => &path[n + 1..],
        None => path,
    }
}

/// Join a canonical directory path and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("a//b/"), "/a/b");
        assert_eq!(normalize("/A/./b"), "/A/b");
    }

    #[test]
    fn test_parent_and_basename() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/a.txt"), Some("/"));
        assert_eq!(parent("/dir/a.txt"), Some("/dir"));
        assert_eq!(basename("/dir/a.txt"), "a.txt");
        assert_eq!(basename("/"), "");
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/d", "a"), "/d/a");
    }
}
