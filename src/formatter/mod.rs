//! Export formatters
//!
//! A formatter turns one [`Record`] into a serialized fragment and declares
//! how a spool file is framed around those fragments:
//! - a header written when the file is opened
//! - a separator written between consecutive fragments of one file
//! - a footer written when the file is closed
//!
//! Framing is per file, so every delivered unit is a complete document.

use crate::error::Result;
use crate::record::Record;

pub mod csv;
pub mod json;

pub use csv::CsvExportFormatter;
pub use json::JsonExportFormatter;

/// Trait for serializing records into spool file fragments
pub trait ExportFormatter: Send + Sync {
    /// File extension of produced units, without the dot
    fn file_extension(&self) -> &str;

    /// Serialize one record
    ///
    /// # Arguments
    /// * `record` - Record to serialize
    ///
    /// # Returns
    /// * `Result<String>` - Fragment without trailing newline
    fn format(&self, record: &Record) -> Result<String>;

    /// Text written at the start of every spool file
    fn format_header(&self) -> String {
        String::new()
    }

    /// Text written before every fragment except the first of a file
    fn item_separator(&self) -> &str {
        ""
    }

    /// Text written at the end of every spool file
    fn format_footer(&self) -> String {
        String::new()
    }

    /// Framing handed to the write buffer
    fn framing(&self) -> Framing {
        Framing {
            header: self.format_header(),
            separator: self.item_separator().to_string(),
            footer: self.format_footer(),
        }
    }
}

/// Per-file framing: header, item separator and footer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Framing {
    pub header: String,
    pub separator: String,
    pub footer: String,
}

impl Framing {
    /// No header, separator or footer: one fragment per line
    pub fn lines() -> Self {
        Self::default()
    }
}
