pub mod auth;
pub mod bookmarks;
pub mod live;
pub mod pages;
