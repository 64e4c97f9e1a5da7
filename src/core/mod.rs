pub mod audit;
pub mod duplicate;
pub mod hash;
pub mod history;
pub mod image;
pub mod metadata;
pub mod normalize;
pub mod scanner;
