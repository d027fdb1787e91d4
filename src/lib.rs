pub mod format;
pub mod text;
pub mod tags;
pub mod table;
pub mod codec;
pub mod library;
pub mod emit;
pub mod minimize;
pub mod vfs;

pub use format::{BinaryKind, DsfSpan, Family};
pub use table::{ContainerEntry, FormatTable};
pub use codec::{load, save, ReadOptions};
pub use library::{load_title, LoadOptions};
pub use emit::{save_table, SaveOptions};
pub use minimize::{minimize, minimize_batch, minimize_file, DeltaReport, MinimizeOptions};
pub use vfs::{pack, unpack, TitleCollector, VfsReader};
