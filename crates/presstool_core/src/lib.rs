pub mod authors;
pub mod block;
pub mod config;
pub mod cursor;
pub mod html;
pub mod mapper;
pub mod media;
pub mod migrate;
pub mod pipeline;
pub mod report;
pub mod runtime;
pub mod shortcode;
pub mod sources;
pub mod store;
pub mod text;
pub mod transform;
pub mod writer;
