pub mod bencode_parser;
pub mod config;
pub mod error;
pub mod events;
pub mod peer;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod swarm;
pub mod torrent;
pub mod tracker;

// Re-export commonly used types and functions for easier access
pub use bencode_parser::parser::{Value, parse};
pub use config::Config;
pub use error::{Error, Result};
pub use events::DownloadEvent;
pub use session::Session;
pub use torrent::Metadata;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_bencode() {
        let data = b"d3:cow3:moo4:spam4:eggse";
        let parsed = parse(data).unwrap();

        let dict = parsed.first().unwrap();
        assert_eq!(dict.get(b"cow").and_then(Value::as_bytes), Some(&b"moo"[..]));
        assert_eq!(dict.get(b"spam").and_then(Value::as_str), Some("eggs"));
        assert_eq!(dict.raw(), Some(&data[..]));
    }
}
