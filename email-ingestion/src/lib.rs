pub mod email_ingester;
pub mod query;

pub use email_ingester::{
    ConnectionReport, EmailIngester, EmailIngesterConfig, ImapConnector, MailMessage,
    MailboxConnector,
};
pub use query::{MailQuery, MessageView};
