mod middleware;
mod public;
mod tts;

pub use middleware::RequestContext;
pub use public::{HttpState, build_router};
