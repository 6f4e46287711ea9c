pub mod ids;
pub mod method;
pub mod request;
pub mod info;
pub mod events;

pub use ids::{RequestId, OwnerToken};
pub use method::HttpMethod;
pub use request::{RequestSource, QueueRequest, RequestPatch, HeadItem};
pub use info::{
    QueueInfo, OperationInfo, BatchAddResult, UnprocessedRequest,
    QueueHead, LockedHead, ProlongResult
};
pub use events::QueueEvent;
