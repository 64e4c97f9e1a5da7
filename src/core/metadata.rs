use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

pub const ID_COLUMN: &str = "occurrenceID";
pub const FILE_COLUMN: &str = "imageFile";

/// Column order of a table created from scratch.
pub const COLUMNS: [&str; 8] = [
    ID_COLUMN,
    "scientificName",
    "imageURL",
    "decimalLatitude",
    "decimalLongitude",
    "eventDate",
    "dataResourceName",
    FILE_COLUMN,
];

#[derive(Debug, Error)]
pub enum TableError {
    #[error("Metadata table not found: {path}")]
    NotFound { path: PathBuf },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed metadata table {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },

    #[error("Metadata table {path} has no {column} column")]
    MissingColumn { path: PathBuf, column: &'static str },
}

/// Header row of a table as read, plus where the two columns the cleaner relies on sit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHeader {
    columns: Vec<String>,
    id_col: usize,
    file_col: usize,
}

impl Default for TableHeader {
    fn default() -> Self {
        Self {
            columns: COLUMNS.iter().map(|c| c.to_string()).collect(),
            id_col: 0,
            file_col: COLUMNS.len() - 1,
        }
    }
}

impl TableHeader {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// One row of a species metadata table.
///
/// Every cell is carried verbatim; only `imageFile` is ever rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationRecord {
    pub occurrence_id: String,
    pub image_file: String,
    fields: Vec<String>,
}

impl ObservationRecord {
    /// Build a row from its cells in `header` order. Short rows are padded with empty cells.
    pub fn from_fields(header: &TableHeader, mut fields: Vec<String>) -> Self {
        if fields.len() < header.columns.len() {
            fields.resize(header.columns.len(), String::new());
        }
        Self {
            occurrence_id: fields[header.id_col].trim().to_string(),
            image_file: fields[header.file_col].trim().to_string(),
            fields,
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn get(&self, header: &TableHeader, column: &str) -> Option<&str> {
        header
            .position(column)
            .and_then(|i| self.fields.get(i))
            .map(String::as_str)
    }

    /// Final path component of `imageFile`, which is all the walker trusts.
    pub fn file_name(&self) -> Option<&str> {
        self.image_file
            .rsplit(['/', '\\'])
            .next()
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
    }

    /// Replace the final component of `imageFile`, keeping any directory prefix.
    pub fn set_file_name(&mut self, name: &str) {
        match self.image_file.rfind(['/', '\\']) {
            Some(idx) => {
                self.image_file.truncate(idx + 1);
                self.image_file.push_str(name);
            }
            None => self.image_file = name.to_string(),
        }
    }

    fn to_fields(&self, header: &TableHeader) -> Vec<String> {
        let mut fields = self.fields.clone();
        // An unchanged reference keeps its original cell bytes.
        if fields[header.file_col].trim() != self.image_file {
            fields[header.file_col] = self.image_file.clone();
        }
        fields
    }
}

/// A table as read from disk: its own header and its rows in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataTable {
    pub header: TableHeader,
    pub rows: Vec<ObservationRecord>,
}

/// Read every row of the table at `path`, in file order.
pub fn read_table(path: &Path) -> Result<MetadataTable, TableError> {
    if !path.is_file() {
        return Err(TableError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let csv_err = |source: csv::Error| TableError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;

    let columns: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();
    let position = |column: &'static str| {
        columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| TableError::MissingColumn {
                path: path.to_path_buf(),
                column,
            })
    };
    let id_col = position(ID_COLUMN)?;
    let file_col = position(FILE_COLUMN)?;
    let header = TableHeader {
        columns,
        id_col,
        file_col,
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let fields = record.iter().map(str::to_string).collect();
        rows.push(ObservationRecord::from_fields(&header, fields));
    }
    Ok(MetadataTable { header, rows })
}

/// Replace the table at `path` with `header` and exactly `records`.
///
/// Rows go to a temporary file in the same directory which is synced and then renamed over
/// the original, so readers see either the old table or the complete new one.
pub fn write_table(
    path: &Path,
    header: &TableHeader,
    records: &[ObservationRecord],
) -> Result<(), TableError> {
    let io_err = |source: std::io::Error| TableError::Io {
        path: path.to_path_buf(),
        source,
    };
    let csv_err = |source: csv::Error| TableError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let tmp = NamedTempFile::new_in(dir).map_err(io_err)?;

    {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(tmp.as_file());
        writer.write_record(header.columns()).map_err(csv_err)?;
        for record in records {
            writer.write_record(record.to_fields(header)).map_err(csv_err)?;
        }
        writer.flush().map_err(io_err)?;
    }
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Stages kept rows for one species and writes them once the pass completes.
pub struct MetadataSynchronizer {
    table_path: PathBuf,
    header: TableHeader,
    kept: Vec<ObservationRecord>,
}

impl MetadataSynchronizer {
    pub fn new(table_path: impl Into<PathBuf>, header: TableHeader) -> Self {
        Self {
            table_path: table_path.into(),
            header,
            kept: Vec::new(),
        }
    }

    pub fn keep(&mut self, record: ObservationRecord) {
        self.kept.push(record);
    }

    pub fn kept(&self) -> &[ObservationRecord] {
        &self.kept
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    /// Destructively replace the table. Consumes the stage so it can only happen once.
    pub fn commit(self) -> Result<usize, TableError> {
        write_table(&self.table_path, &self.header, &self.kept)?;
        Ok(self.kept.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) fn record(id: &str, file: &str) -> ObservationRecord {
        let url = format!("https://example.org/{}.jpg", id);
        let fields = [
            id,
            "Vulpes vulpes",
            url.as_str(),
            "-33.86",
            "151.2",
            "2023-04-01",
            "iNaturalist",
            file,
        ];
        ObservationRecord::from_fields(
            &TableHeader::default(),
            fields.iter().map(|f| f.to_string()).collect(),
        )
    }

    #[test]
    fn test_read_sparse_columns() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metadata.csv");
        fs::write(
            &path,
            "occurrenceID,imageFile,decimalLatitude\n\
             a1, a1.jpg ,-12.5\n\
             b2,b2.png\n",
        )
        .unwrap();

        let table = read_table(&path).unwrap();
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].occurrence_id, "a1");
        assert_eq!(table.rows[0].image_file, "a1.jpg");
        assert_eq!(table.rows[0].get(&table.header, "decimalLatitude"), Some("-12.5"));
        assert_eq!(table.rows[1].image_file, "b2.png");
        assert_eq!(table.rows[1].get(&table.header, "decimalLatitude"), Some(""));
        assert_eq!(table.rows[1].get(&table.header, "scientificName"), None);
    }

    #[test]
    fn test_missing_required_column() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metadata.csv");
        fs::write(&path, "occurrenceID,scientificName\nx,Vulpes vulpes\n").unwrap();

        assert!(matches!(
            read_table(&path),
            Err(TableError::MissingColumn {
                column: "imageFile",
                ..
            })
        ));
    }

    #[test]
    fn test_missing_table() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            read_table(&temp_dir.path().join("metadata.csv")),
            Err(TableError::NotFound { .. })
        ));
    }

    #[test]
    fn test_write_then_read_preserves_order() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metadata.csv");
        let rows = vec![record("3", "3.jpg"), record("1", "1.jpg"), record("2", "2.jpg")];

        write_table(&path, &TableHeader::default(), &rows).unwrap();
        let table = read_table(&path).unwrap();
        assert_eq!(table.header, TableHeader::default());
        assert_eq!(table.rows, rows);

        // No stray temporaries left beside the table.
        let entries: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_empty_table_keeps_header() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metadata.csv");
        fs::write(&path, "occurrenceID,imageFile,basisOfRecord\n1,a.jpg,HUMAN_OBSERVATION\n")
            .unwrap();

        let table = read_table(&path).unwrap();
        MetadataSynchronizer::new(&path, table.header).commit().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "occurrenceID,imageFile,basisOfRecord\n");
        assert!(read_table(&path).unwrap().rows.is_empty());
    }

    #[test]
    fn test_rewrite_keeps_foreign_columns_and_cells() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metadata.csv");
        fs::write(
            &path,
            "occurrenceID,imageFile,decimalLatitude,basisOfRecord\n\
             1,a.png,-33.8688000,HUMAN_OBSERVATION\n\
             2,b.jpg,unknown,\"PRESERVED, SPECIMEN\"\n\
             3,c.jpg,,MACHINE_OBSERVATION\n",
        )
        .unwrap();

        let table = read_table(&path).unwrap();
        let mut sync = MetadataSynchronizer::new(&path, table.header.clone());
        let mut rows = table.rows.into_iter();
        let mut first = rows.next().unwrap();
        first.set_file_name("a.jpg");
        sync.keep(first);
        sync.keep(rows.next().unwrap());
        assert_eq!(sync.commit().unwrap(), 2);

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "occurrenceID,imageFile,decimalLatitude,basisOfRecord\n\
             1,a.jpg,-33.8688000,HUMAN_OBSERVATION\n\
             2,b.jpg,unknown,\"PRESERVED, SPECIMEN\"\n"
        );
    }

    #[test]
    fn test_synchronizer_replaces_wholesale() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metadata.csv");
        let header = TableHeader::default();
        write_table(&path, &header, &[record("old", "old.jpg"), record("older", "older.jpg")])
            .unwrap();

        let mut sync = MetadataSynchronizer::new(&path, header);
        sync.keep(record("new", "new.jpg"));
        assert_eq!(sync.commit().unwrap(), 1);

        let rows = read_table(&path).unwrap().rows;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].occurrence_id, "new");
    }

    #[test]
    fn test_file_name_handling() {
        let mut rec = record("1", "data/raw/vulpes_vulpes/123.png");
        assert_eq!(rec.file_name(), Some("123.png"));
        rec.set_file_name("123.jpg");
        assert_eq!(rec.image_file, "data/raw/vulpes_vulpes/123.jpg");

        let mut bare = record("2", "456.gif");
        bare.set_file_name("456.jpg");
        assert_eq!(bare.image_file, "456.jpg");

        assert_eq!(record("3", "../").file_name(), None);
        assert_eq!(record("4", "a/..").file_name(), None);
        assert_eq!(record("5", "").file_name(), None);
    }
}
