pub mod cleanup;
pub mod estimate;
pub mod external;
pub mod relocate;
pub mod replace;
