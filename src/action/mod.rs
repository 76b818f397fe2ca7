pub(crate) mod bootstrap;
pub(crate) mod lookup;
pub(crate) mod refresh;
