pub mod path;

pub use path::{
    contains, decode_spaces, depth, encode_spaces, extension, file_name, file_stem, fold, join,
    normalize, os_path_to_string, overlaps, parent, rebase, relative, string_to_os_path,
    strip_extension, to_anchor, HrefPath,
};
