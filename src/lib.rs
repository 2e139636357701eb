#![recursion_limit = "256"]

pub mod box_coder;
pub mod boxes;
pub mod broadcast;
pub mod cascade;
pub mod config;
pub mod debug;
pub mod gradient;
pub mod instances;
pub mod loss;
pub mod matcher;
pub mod models;
pub mod nms;
pub mod pooler;
pub mod stats;
pub mod torch_ops;
