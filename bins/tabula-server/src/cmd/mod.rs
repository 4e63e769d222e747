pub mod inspect;
pub mod plan;
pub mod serve;
