use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a dial string of the form `proto!address!port`.
pub fn parse_proto(arg: &str) -> Option<(&str, &str, &str)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);

    Some((proto, addr, port))
}

/// Lexically clean a slash separated path into its elements.
///
/// Empty elements and `.` are dropped, `..` removes the preceding element and
/// is ignored at the root, so `"/a/./b/../c"` yields `["a", "c"]`.
pub fn split_path(path: &str) -> Vec<&str> {
    let mut elems = Vec::new();
    for elem in path.split('/') {
        match elem {
            "" | "." => {}
            ".." => {
                elems.pop();
            }
            _ => elems.push(elem),
        }
    }
    elems
}

/// Split a path into its cleaned parent elements and final element.
///
/// Returns `None` for paths naming the root.
pub fn split_base(path: &str) -> Option<(Vec<&str>, &str)> {
    let mut elems = split_path(path);
    let base = elems.pop()?;
    Some((elems, base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_strings() {
        assert_eq!(
            parse_proto("tcp!127.0.0.1!5640"),
            Some(("tcp", "127.0.0.1", "5640"))
        );
        assert_eq!(parse_proto("tcp!localhost"), None);
    }

    #[test]
    fn path_cleaning() {
        assert!(split_path("").is_empty());
        assert!(split_path("/").is_empty());
        assert!(split_path("/..").is_empty());
        assert_eq!(split_path("/a/./b/../c/"), vec!["a", "c"]);
        assert_eq!(split_path("tmp//x"), vec!["tmp", "x"]);
    }

    #[test]
    fn base_of_root_is_none() {
        assert_eq!(split_base("/"), None);
        assert_eq!(split_base("/tmp/x"), Some((vec!["tmp"], "x")));
        assert_eq!(split_base("x"), Some((vec![], "x")));
    }
}
