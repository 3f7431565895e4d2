mod cache;
mod cdr;
mod end_record;
mod entry;
mod factory;
mod flags;
mod format;
mod headers;
mod local_entry;
mod path_pool;
mod relink;
mod stream;
mod tree;

pub use cache::{ArchiveCache, CacheOptions};
pub use cdr::{
    decode_directory, encode_directory, CdrHeaders, CentralRecord, DecodedDirectory,
    EncodeOptions, EncodedDirectory, CDR_PREAMBLE_SIGNATURE, CDR_VERSION,
    CENTRAL_RECORD_SIGNATURE,
};
pub use end_record::{EndRecord, END_RECORD_SIGNATURE, END_RECORD_SIZE};
pub use entry::{FileEntry, TreeId};
pub use factory::{CacheFactory, SharedCache};
pub use flags::{CacheFlags, EntryFlags};
pub use format::{
    FileHeader, FORMAT_VERSION_MAJOR, FORMAT_VERSION_MINOR, HEADER_FLAG_CDR_PENDING, HEADER_SIZE,
    MAGIC_NUMBER,
};
pub use headers::{CdrKey, EncryptionHeader, ExtendedHeader, KeyDerivation, SignatureHeader};
pub use local_entry::{LocalRecordHeader, LOCAL_RECORD_FIXED_SIZE, LOCAL_RECORD_SIGNATURE};
pub use path_pool::{normalize_dir_path, normalize_path, PathPool};
pub use relink::{stale_temp_files, RelinkStats};
pub use stream::StreamProgress;
pub use tree::{Entries, FileEntryTree};
