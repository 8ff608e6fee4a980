pub mod evaluate;
pub mod run;
pub mod status;
