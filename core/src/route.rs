/// Path resolution for `/restful/meshms/...`
use crate::error::{MeshmsError, Result};
use crate::sid::Sid;
use crate::token::MeshmsToken;
use hyper::Method;

pub const MESHMS_PATH_PREFIX: &str = "/restful/meshms/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `<sid>/conversationlist.json`
    ConversationList { me: Sid },
    /// `<sid>/<sid>/messagelist.json`
    MessageList { me: Sid, them: Sid },
    /// `<sid>/<sid>/newsince/<token>/messagelist.json`
    NewsinceMessageList {
        me: Sid,
        them: Sid,
        token: MeshmsToken,
    },
    /// `<sid>/<sid>/sendmessage`
    SendMessage { me: Sid, them: Sid },
}

impl Route {
    /// The only method the endpoint answers.
    pub fn verb(&self) -> Method {
        match self {
            Route::SendMessage { .. } => Method::POST,
            _ => Method::GET,
        }
    }
}

fn not_found() -> MeshmsError {
    MeshmsError::NotFound("Not found".to_string())
}

fn parse(remainder: &str) -> Result<Route> {
    let (me, rest) = Sid::parse_prefix(remainder).ok_or_else(not_found)?;
    let rest = rest.strip_prefix('/').ok_or_else(not_found)?;
    if rest == "conversationlist.json" {
        return Ok(Route::ConversationList { me });
    }

    let (them, rest) = Sid::parse_prefix(rest).ok_or_else(not_found)?;
    match rest {
        "/messagelist.json" => Ok(Route::MessageList { me, them }),
        "/sendmessage" => Ok(Route::SendMessage { me, them }),
        _ => {
            let rest = rest.strip_prefix("/newsince/").ok_or_else(not_found)?;
            let (token, rest) = MeshmsToken::decode_prefix(rest)?;
            if rest != "/messagelist.json" {
                return Err(not_found());
            }
            Ok(Route::NewsinceMessageList { me, them, token })
        }
    }
}

/// Resolve the part of the path after [`MESHMS_PATH_PREFIX`].
///
/// Unknown paths and unparseable tokens are not found; a known path asked
/// for with the wrong method is not allowed.
pub fn resolve(method: &Method, remainder: &str) -> Result<Route> {
    let route = parse(remainder)?;
    if *method != route.verb() {
        return Err(MeshmsError::MethodNotAllowed);
    }
    Ok(route)
}
