use std::fmt::Display;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Formats a path so that it can be pasted into a POSIX shell.
///
/// Used when we print hints such as `chroot /tmp/disk_mount_.../root`.
#[derive(Debug)]
pub struct PathQuotedDisplay<'a> {
    path: &'a Path,
}

impl Display for PathQuotedDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(s) = self.path.to_str() {
            if is_shell_safe(s) {
                return f.write_str(s);
            }
        }
        let quoted = shlex::bytes::try_quote(self.path.as_os_str().as_bytes())
            .map_err(|_| std::fmt::Error)?;
        let quoted = std::str::from_utf8(&quoted).map_err(|_| std::fmt::Error)?;
        f.write_str(quoted)
    }
}

impl<'a> PathQuotedDisplay<'a> {
    /// Given a path, quote it in a way that it would be parsed by a default
    /// POSIX shell. Plain paths are returned unchanged.
    pub fn new<P: AsRef<Path> + ?Sized>(path: &'a P) -> PathQuotedDisplay<'a> {
        PathQuotedDisplay {
            path: path.as_ref(),
        }
    }
}

fn is_shell_safe(s: &str) -> bool {
    s.chars()
        .all(|c| matches!(c, '/' | '.' | '-' | '_') || c.is_ascii_alphanumeric())
}

/// Join a program and its arguments into a single shell-like string, for logging.
pub fn shell_join<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|a| {
            let a = a.as_ref();
            if !a.is_empty() && is_shell_safe(a) {
                a.to_string()
            } else {
                shlex::try_quote(a)
                    .map(|q| q.into_owned())
                    .unwrap_or_else(|_| a.to_string())
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
