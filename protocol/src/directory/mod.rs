mod record;

pub use record::{Envelope, GameEntry, GameList, LobbyCreated, RegistrationRecord, ServerAdvertisement};
