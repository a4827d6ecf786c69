mod events;
mod requests;
mod responses;

pub use events::*;
pub use requests::*;
pub use responses::*;
