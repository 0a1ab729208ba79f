//! Tests fuer den Sealchat-Client

mod support;

mod ende_zu_ende_tests;
mod reconnect_tests;
