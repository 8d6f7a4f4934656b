pub(crate) mod delta;
pub(crate) mod dump;
pub(crate) mod parse;
pub(crate) mod props;
pub(crate) mod source;
