// cinesync-common: shared types and the wire protocol for the cinesync workspace

pub mod protocol;
pub mod types;
