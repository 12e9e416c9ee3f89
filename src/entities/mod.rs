// Versioned entity kinds
// Each kind pairs a current table with a *_history twin.

pub mod currency_price;
pub mod realtor;
pub mod user;

pub use currency_price::CurrencyPrice;
pub use realtor::Realtor;
pub use user::User;
