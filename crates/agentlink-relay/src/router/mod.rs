//! Frame routing between live connections.

mod dispatcher;


pub use dispatcher::Router;
