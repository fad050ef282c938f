pub mod errors;
pub mod events;
pub mod ids;
pub mod ledger;
pub mod provider;
pub mod record;
pub mod stream;
pub mod tokens;
pub mod tools;
pub mod transcript;
