use rocket::http::{ContentType, Header, Status};
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rocket::{Request, Route};
use serde::Serialize;
use std::io::Cursor;

pub mod admin;
pub mod auth;
pub mod images;
pub mod researcher;
pub mod results;
pub mod staff;
pub mod study;

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: &str) -> Json<Self> {
        Json(Self {
            message: message.to_string(),
        })
    }
}

/// Raw bytes sent with a `Content-Disposition` header, either shown inline
/// or offered as a download.
pub struct FileResponse {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub content_type: ContentType,
    pub attachment: bool,
}

impl FileResponse {
    pub fn inline(filename: String, bytes: Vec<u8>) -> Self {
        let content_type = filename
            .rsplit_once('.')
            .and_then(|(_, ext)| ContentType::from_extension(ext))
            .unwrap_or(ContentType::Binary);

        Self {
            filename,
            bytes,
            content_type,
            attachment: false,
        }
    }

    pub fn csv_attachment(filename: String, bytes: Vec<u8>) -> Self {
        Self {
            filename,
            bytes,
            content_type: ContentType::CSV,
            attachment: true,
        }
    }
}

impl<'r> Responder<'r, 'static> for FileResponse {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        let disposition = if self.attachment { "attachment" } else { "inline" };
        let filename = self.filename.replace(['"', '\r', '\n'], "_");

        Response::build()
            .status(Status::Ok)
            .header(self.content_type)
            .header(Header::new(
                "Content-Disposition",
                format!("{}; filename=\"{}\"", disposition, filename),
            ))
            .sized_body(self.bytes.len(), Cursor::new(self.bytes))
            .ok()
    }
}

#[get("/health")]
pub fn health() -> &'static str {
    "OK"
}

pub fn routes() -> Vec<Route> {
    let mut routes = routes![health];
    routes.extend(auth::routes());
    routes.extend(study::routes());
    routes.extend(results::routes());
    routes.extend(researcher::routes());
    routes.extend(staff::routes());
    routes.extend(admin::routes());
    routes.extend(images::routes());
    routes
}
