//! Integration tests for the harvester
//!
//! Coordinator tests drive a scripted in-memory extractor; the sitemap tests
//! run the whole pipeline against a wiremock site.

#[allow(dead_code)]
mod common;
mod harvest_tests;
mod sitemap_tests;
