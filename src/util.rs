pub mod date_utils;
pub mod test_util;
