pub mod assign;
pub mod fusion;
