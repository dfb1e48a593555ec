// Core modules implementing predicate compilation, lazy scans, encoding, and error modeling.
pub mod cancel;
pub mod encode;
pub mod error;
pub mod params;
pub mod predicate;
pub mod query;
pub mod scan;
