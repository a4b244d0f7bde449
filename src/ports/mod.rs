pub mod clock;
pub mod deliver;
pub mod fetch;
pub mod random;
pub mod repo;
