pub(crate) mod bucket;
pub(crate) mod contact;
pub(crate) mod table;
