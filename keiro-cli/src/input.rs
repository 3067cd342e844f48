use std::fs;
use std::path::Path;

use crate::error::{CliError, CliResult};

/// Reads a JSON argument. `@path` reads the file at `path`, `-` reads stdin,
/// anything else is parsed as inline JSON.
pub fn read_json(argument: &str) -> CliResult<serde_json::Value> {
    let text = if let Some(path) = argument.strip_prefix('@') {
        fs::read_to_string(Path::new(path))?
    } else if argument == "-" {
        std::io::read_to_string(std::io::stdin())?
    } else {
        argument.to_string()
    };
    Ok(serde_json::from_str(&text)?)
}

/// Reads pipeline input documents: a JSON array, or a single document.
pub fn read_documents(argument: Option<&str>) -> CliResult<Vec<serde_json::Value>> {
    match argument.map(read_json).transpose()? {
        None => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => Ok(items),
        Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(document @ serde_json::Value::Object(_)) => Ok(vec![document]),
        Some(other) => Err(CliError::Usage(format!(
            "input must be an array of documents, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_inline_and_file_arguments() {
        assert_eq!(read_json(r#"{"a": 1}"#).unwrap(), json!({ "a": 1 }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[1, 2]").unwrap();
        let argument = format!("@{}", file.path().display());
        assert_eq!(read_json(&argument).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_documents_shape() {
        assert_eq!(read_documents(None).unwrap(), Vec::<serde_json::Value>::new());
        assert_eq!(read_documents(Some(r#"{"a": 1}"#)).unwrap(), vec![json!({ "a": 1 })]);
        assert!(matches!(
            read_documents(Some("3")),
            Err(CliError::Usage(_))
        ));
    }
}
