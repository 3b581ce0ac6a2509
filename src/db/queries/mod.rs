pub mod instance;
pub mod member;
pub mod pool;
pub mod project;
pub mod volume;
