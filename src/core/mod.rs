// Core modules implementing library discovery, classification, and limiting.
pub mod aggregate;
pub mod controller;
pub mod controllers;
pub mod dylib;
pub mod error;
pub mod limits;
pub mod registry;
pub mod scan;
