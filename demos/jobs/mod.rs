pub mod ai_matching;
pub mod send_email;
