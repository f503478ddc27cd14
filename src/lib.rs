pub mod acl;
pub mod cache;
pub mod client;
pub mod error;
pub mod geopoint;
pub mod live_query;
pub mod materializer;
pub mod object;
pub mod op;
pub mod query;
pub mod registry;
pub mod relations;
pub mod requests;
pub mod types;

pub use acl::{AclTarget, ParseACL};
pub use cache::{EntityCache, EntityKey, MergeOutcome};
pub use client::Parse;
pub use error::ParseError;
pub use geopoint::{ParseGeoPoint, ParsePolygon};
pub use live_query::{
    ChannelState, ClientEvent, LiveConnector, LiveError, LiveEvent, LiveQueryClient, LiveQueryOptions,
    LiveSocket, Subscription, SubscriptionState, WsConnector,
};
pub use materializer::Materializer;
pub use object::ParseObject;
pub use op::FieldOp;
pub use query::{CompiledQuery, EachOptions, ParseQuery, QueryCursor, TextSearch};
pub use registry::{ClassRegistry, Decoded, ParseClass};
pub use relations::Relation;
pub use requests::{HttpTransport, RestRequest, Transport};

// Re-export key types from the types module if needed directly
pub use types::{FileField, ParseDate, ParseRelation, ParseValue, Pointer};
