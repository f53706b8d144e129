// Route module decomposition — each area in its own file; the JSON API is
// strictly read-only.

mod rooms;
mod search;
mod system;

pub use rooms::{get_room, list_rooms, room_avatar};
pub use search::search_rooms;
pub use system::{health, not_found, stats};
