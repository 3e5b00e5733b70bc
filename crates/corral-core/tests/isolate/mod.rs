#![allow(dead_code)]

mod bridge;
mod common;
mod snapshot;
