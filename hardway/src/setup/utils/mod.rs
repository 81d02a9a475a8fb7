pub mod cfssl;
pub mod gcloud;
pub mod inventory;
pub mod kctl;
pub mod layout;
pub mod validate;
