pub mod dead_letter; // 死信消费者 / Dead-letter consumer
pub mod record; // 流记录模型 / Stream record model

pub use dead_letter::{
    quarantine, AlertSink, DeadLetterConsumer, DeadLetterSettings, DeadLetterStats, LogAlertSink,
};
pub use record::StreamRecord;
