//! Integration tests: full scan passes against scripted sources.

mod mock_sources;
mod scan_engine;
