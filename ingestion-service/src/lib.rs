//! Ingestion Service - financial message intake and extraction.

pub mod config;
pub mod dtos;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;
