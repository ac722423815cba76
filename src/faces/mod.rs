pub mod embedding;

pub use embedding::Embedding;
