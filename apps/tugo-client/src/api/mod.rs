pub mod notes;

pub use notes::NotesApi;
