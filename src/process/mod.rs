// src/process/mod.rs
pub mod decode;
pub mod extract;
pub mod layout;
pub mod merge;
pub mod sheet;
pub mod table;
pub mod write;

pub use decode::{decode, decode_file, RecordBatches};
pub use extract::extract;
pub use layout::{load_dictionary, load_sas_input, FieldSpec, LayoutDictionary};
pub use merge::{load_deflator, merge, DeflatorTable};
pub use table::{DecodedTable, MergedTable, Table};
pub use write::{cleanup, write};
