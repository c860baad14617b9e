//! Integration tests for the translation engine crates.
//!
//! [`toy`] provides a minimal guest CPU and an interpreting backend
//! so the execution engine can be driven without a real target.


#[cfg(test)]
mod backend;
#[cfg(test)]
mod exec;
#[cfg(test)]
mod softmmu;
