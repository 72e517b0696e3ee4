pub mod append_log;
pub mod feed;
pub mod ingestor;
pub mod window;

pub use append_log::AppendLog;
pub use feed::{BitstampFeed, ChannelFeed, FeedTrade, TradeFeed};
pub use ingestor::{IngestorHandle, TradeIngestor, TradeSink};
pub use window::{RingBuffer, SlidingWindowBuffer};
