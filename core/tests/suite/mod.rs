mod resume;
mod streaming;
