use std::path::Path;

use crate::{
    error::{Result, ScanError},
    segment::MAX_ELEMENTS,
};

/// Reads whitespace-separated integers from `path`.
///
/// Values past [`MAX_ELEMENTS`] are dropped with a warning.
pub fn read_values(path: &Path) -> Result<Vec<i32>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ScanError::input(format!("cannot read {}: {e}", path.display())))?;
    parse_values(&text).map_err(|e| match e {
        ScanError::Input(msg) => ScanError::input(format!("{}: {msg}", path.display())),
        other => other,
    })
}

pub fn parse_values(text: &str) -> Result<Vec<i32>> {
    let mut values = Vec::new();
    let mut dropped = 0usize;

    for (pos, token) in text.split_whitespace().enumerate() {
        let value: i32 = token
            .parse()
            .map_err(|_| ScanError::input(format!("value #{} {token:?} is not an integer", pos + 1)))?;
        if values.len() < MAX_ELEMENTS {
            values.push(value);
        } else {
            dropped += 1;
        }
    }

    if values.is_empty() {
        return Err(ScanError::input("no values"));
    }
    if dropped > 0 {
        tracing::warn!(dropped, kept = MAX_ELEMENTS, "data file has too many values");
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_any_whitespace() {
        assert_eq!(parse_values("1 2\n3\t-4  \n").unwrap(), vec![1, 2, 3, -4]);
    }

    #[test]
    fn caps_at_max_elements() {
        let text = (0..300).map(|v| v.to_string()).collect::<Vec<_>>().join(" ");
        let values = parse_values(&text).unwrap();
        assert_eq!(values.len(), MAX_ELEMENTS);
        assert_eq!(values[255], 255);
    }

    #[test]
    fn rejects_garbage_and_empty_input() {
        assert!(matches!(parse_values("1 two 3"), Err(ScanError::Input(_))));
        assert!(matches!(parse_values("1 2.5"), Err(ScanError::Input(_))));
        assert!(matches!(parse_values(" \n "), Err(ScanError::Input(_))));
    }

    #[test]
    fn missing_file_is_input_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_values(&dir.path().join("nope")),
            Err(ScanError::Input(_))
        ));

        let path = dir.path().join("data");
        std::fs::write(&path, "4 8 2 10\n").unwrap();
        assert_eq!(read_values(&path).unwrap(), vec![4, 8, 2, 10]);
    }
}
