mod helpers;
mod mirror;
mod store;
