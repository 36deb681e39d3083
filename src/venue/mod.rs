pub mod paper;
pub mod retry;
pub mod traits;

pub use paper::PaperVenue;
pub use retry::{with_retry, RetryPolicy};
pub use traits::{VenueClient, VenueError, VenueOrderSpec, VenueOrderStatus, VenueStatusReport};
