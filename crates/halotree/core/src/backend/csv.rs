// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Delimited text catalogs
//!
//! The file starts with three comment lines giving field names, field types
//! (`int`, `float` or `str`) and units (`None` for dimensionless):
//!
//! ```text
//! #uid,desc_uid,mass
//! #int,int,float
//! #None,None,Msun
//! 1,-1,10.0
//! ```
//!
//! Values follow the usual quoting rules, so quoted names and string values
//! may contain the separator. String columns are skipped. Halos whose
//! descendant is missing from the file become roots by default.

use std::fs;
use std::path::Path;

use ::csv::{ReaderBuilder, Trim};
use tracing::debug;

use super::{MemoryBackend, MissingDescendantPolicy};
use crate::error::{ArborResult, BackendError};
use crate::fields::FieldValues;

/// Options for reading a text catalog
#[derive(Debug, Clone)]
pub struct CsvOptions {
    pub separator: char,
    pub missing_descendants: MissingDescendantPolicy,
    pub forest_field: Option<String>,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            separator: ',',
            missing_descendants: MissingDescendantPolicy::PromoteToRoot,
            forest_field: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Int,
    Float,
    Str,
}

impl ColumnType {
    fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "int" | "int64" | "int32" => Some(ColumnType::Int),
            "float" | "float64" | "float32" | "double" => Some(ColumnType::Float),
            "str" | "string" => Some(ColumnType::Str),
            _ => None,
        }
    }
}

enum Column {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Skipped,
}

/// Reads a delimited catalog into a [`MemoryBackend`].
pub fn read_csv(path: impl AsRef<Path>, options: &CsvOptions) -> ArborResult<MemoryBackend> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| BackendError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_error = |line: usize, message: String| BackendError::Parse {
        path: path.to_path_buf(),
        line,
        message,
    };
    let delimiter = u8::try_from(options.separator)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| parse_error(0, format!("separator '{}' is not a single ASCII character", options.separator)))?;
    let reader_builder = || {
        let mut builder = ReaderBuilder::new();
        builder.delimiter(delimiter).has_headers(false).trim(Trim::All).flexible(true);
        builder
    };

    let mut lines = content.lines();
    let mut header: Vec<Vec<String>> = Vec::with_capacity(3);
    for number in 1..=3 {
        let line = lines.next().ok_or_else(|| parse_error(number, "expected three header lines".to_string()))?;
        let stripped = line.trim().strip_prefix('#').ok_or_else(|| parse_error(number, "header lines must start with '#'".to_string()))?;
        let record = reader_builder()
            .from_reader(stripped.as_bytes())
            .records()
            .next()
            .transpose()
            .map_err(|err| parse_error(number, err.to_string()))?
            .unwrap_or_default();
        header.push(record.iter().map(str::to_string).collect());
    }

    let (names, types, units) = (&header[0], &header[1], &header[2]);
    if names.len() != types.len() || names.len() != units.len() {
        return Err(parse_error(3, "header lines must have the same number of values".to_string()).into());
    }

    let mut columns: Vec<Column> = Vec::with_capacity(names.len());
    for (name, type_name) in names.iter().zip(types) {
        let column_type = ColumnType::parse(type_name).ok_or_else(|| parse_error(2, format!("unknown type '{type_name}' for {name}")))?;
        let column_type = if name == "uid" || name == "desc_uid" { ColumnType::Int } else { column_type };
        columns.push(match column_type {
            ColumnType::Int => Column::Int(Vec::new()),
            ColumnType::Float => Column::Float(Vec::new()),
            ColumnType::Str => Column::Skipped,
        });
    }

    // Header lines are comments to the body reader.
    let mut reader = reader_builder().comment(Some(b'#')).from_reader(content.as_bytes());
    for result in reader.records() {
        let record = result.map_err(|err| parse_error(err.position().map_or(0, |position| position.line() as usize), err.to_string()))?;
        let line = record.position().map_or(0, |position| position.line() as usize);
        if record.len() == 1 && record.get(0).is_some_and(str::is_empty) {
            continue;
        }
        if record.len() != names.len() {
            return Err(parse_error(line, format!("expected {} values, found {}", names.len(), record.len())).into());
        }
        for ((column, value), name) in columns.iter_mut().zip(record.iter()).zip(names) {
            let invalid = || parse_error(line, format!("invalid value '{value}' for {name}"));
            match column {
                Column::Int(data) => data.push(value.parse::<i64>().or_else(|_| value.parse::<f64>().map(|v| v as i64)).map_err(|_| invalid())?),
                Column::Float(data) => data.push(value.parse::<f64>().map_err(|_| invalid())?),
                Column::Skipped => {}
            }
        }
    }

    let name = path.file_stem().map_or_else(|| path.display().to_string(), |stem| stem.to_string_lossy().to_string());
    let mut builder = MemoryBackend::builder(name).missing_descendants(options.missing_descendants.clone());
    for ((column, field), unit) in columns.into_iter().zip(names).zip(units) {
        let unit = if unit == "None" { "" } else { unit.as_str() };
        builder = match column {
            Column::Int(data) => builder.column(field.clone(), FieldValues::Int(data), unit),
            Column::Float(data) => builder.column(field.clone(), FieldValues::Float(data), unit),
            Column::Skipped => {
                debug!("Skipping string column {} in {}", field, path.display());
                builder
            }
        };
    }
    if let Some(forest_field) = &options.forest_field {
        builder = builder.forest_field(forest_field.clone());
    }

    builder.build()
}

/// True if `path` looks like a delimited text catalog.
pub fn is_csv_path(path: &Path) -> bool {
    matches!(path.extension().and_then(|ext| ext.to_str()), Some("csv" | "txt" | "dat"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::backend::{DataBackend, RowSelection};
    use tempfile::TempDir;

    fn write_catalog(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("catalog.csv");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_read_catalog() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_catalog(
            &temp_dir,
            "#uid,desc_uid,mass,name\n#int,int,float,str\n#None,None,\"Msun\",None\n1,-1,10.0,a\n2,1,4.0,b\n3,1,6.0,c\n",
        );

        let backend = read_csv(&path, &CsvOptions::default()).unwrap();
        let declarations = backend.field_declarations();
        assert_eq!(declarations.native.len(), 3);
        assert_eq!(declarations.native[2].units, "Msun");

        let planted = backend.plant().unwrap();
        assert_eq!(planted.locations.len(), 1);
        let rows = RowSelection::Range { start: 0, end: 3 };
        let mass = backend.read_fields(0, &rows, &["mass".to_string()]).unwrap();
        assert_eq!(mass["mass"], FieldValues::Float(vec![10.0, 4.0, 6.0]));
    }

    #[test]
    fn test_missing_descendant_becomes_root() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_catalog(&temp_dir, "#uid desc_uid\n#int int\n#None None\n1 -1\n2 7\n");

        let options = CsvOptions {
            separator: ' ',
            ..Default::default()
        };
        let backend = read_csv(&path, &options).unwrap();
        let planted = backend.plant().unwrap();
        assert_eq!(planted.locations.len(), 2);
        assert_eq!(planted.reassignments.len(), 1);
        assert_eq!(planted.reassignments[0].old_desc_uid, 7);
    }

    #[test]
    fn test_malformed_rows() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_catalog(&temp_dir, "#uid,desc_uid\n#int,int\n#None,None\n1,-1\n2\n");
        let err = read_csv(&path, &CsvOptions::default()).unwrap_err();
        assert!(matches!(err, crate::ArborError::Backend(BackendError::Parse { ref message, .. }) if message == "expected 2 values, found 1"));

        let path = write_catalog(&temp_dir, "uid,desc_uid\n");
        assert!(read_csv(&path, &CsvOptions::default()).is_err());
    }

    #[test]
    fn test_quoted_values_keep_separators() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_catalog(
            &temp_dir,
            "#uid,desc_uid,\"name, label\",mass\n#int,int,str,float\n#None,None,None,Msun\n1,-1,\"halo, one\",10.0\n2,1,\"say \"\"hi\"\"\",4.0\n",
        );

        let backend = read_csv(&path, &CsvOptions::default()).unwrap();
        let names: Vec<String> = backend.field_declarations().native.into_iter().map(|field| field.name).collect();
        assert_eq!(names, vec!["uid", "desc_uid", "mass"]);
        backend.plant().unwrap();
        let mass = backend.read_fields(0, &RowSelection::Range { start: 0, end: 2 }, &["mass".to_string()]).unwrap();
        assert_eq!(mass["mass"], FieldValues::Float(vec![10.0, 4.0]));
    }

    #[test]
    fn test_separator_must_be_ascii() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_catalog(&temp_dir, "#uid,desc_uid\n#int,int\n#None,None\n1,-1\n");
        let options = CsvOptions {
            separator: '\u{2502}',
            ..Default::default()
        };
        assert!(matches!(read_csv(&path, &options), Err(crate::ArborError::Backend(BackendError::Parse { line: 0, .. }))));
    }

    #[test]
    fn test_csv_extension() {
        assert!(is_csv_path(Path::new("trees.csv")));
        assert!(!is_csv_path(Path::new("trees.arbor")));
    }
}
