//! IPC command handlers, grouped by domain. Each handler parses its
//! `arg0` payload, delegates to the domain module and answers with JSON.

pub mod carros;
pub mod chat;
pub mod diagnostics;
pub mod divergencias;
pub mod maintenance;
pub mod notas;
pub mod print;
pub mod scanner;
pub mod settings;
pub mod sync;
pub mod wms;
