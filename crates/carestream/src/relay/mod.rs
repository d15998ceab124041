mod reframe;
mod repair;
mod server;
mod stream_id;

pub use reframe::{
    DATA_PREFIX, DONE_SENTINEL, EVENT_DELIMITER, EventReframer, PushOutcome, ReframeError,
    Utf8Decoder,
};
pub use repair::{parse_failure_event, relay_failure_event, repair_event};
pub use server::{AppState, RelayServer, create_router};
pub use stream_id::{StreamId, StreamIdError};
