pub mod names;
pub mod revision;

pub const VALID_NAME_REGEX: &str = r"^[a-zA-Z0-9_-]+$";
pub const PARENT_REGEX: &str = r"^(.+)\^(\d*)$";
pub const ANCESTOR_REGEX: &str = r"^(.+)~(\d*)$";
pub const FROM_ROOT_REGEX: &str = r"^(.+)\.(\d+)$";
