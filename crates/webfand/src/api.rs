//! Local host API: reads cached characteristics and drives sets and
//! identify for every configured accessory.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tiny_http::{Method, Response, Server, StatusCode};
use tracing::{info, warn};

use crate::accessory::FanAccessory;
use crate::characteristic::{Characteristic, CharacteristicValue, FanState};
use crate::config::AccessoryInformation;
use crate::error::Error;

const ACCESSORIES_PREFIX: &str = "/v1/accessories/";

#[derive(Serialize)]
struct AccessoryView {
    name: String,
    information: AccessoryInformation,
    state: FanState,
}

#[derive(Deserialize)]
struct SetRequest {
    value: Value,
}

fn view(accessory: &FanAccessory) -> AccessoryView {
    AccessoryView {
        name: accessory.name().to_string(),
        information: accessory.information(),
        state: accessory.state(),
    }
}

pub fn run_api_server(
    accessories: &[FanAccessory],
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::http(("127.0.0.1", port)).map_err(|err| -> Box<dyn std::error::Error> {
        format!("Failed to bind 127.0.0.1:{port} (is the port already in use?): {err}").into()
    })?;
    info!("webfand API listening on http://127.0.0.1:{port}");

    for mut request in server.incoming_requests() {
        let method = request.method().clone();
        let url = request.url().to_string();
        let (path, _query) = url.split_once('?').unwrap_or((url.as_str(), ""));

        let mut body = String::new();
        let _ = std::io::Read::read_to_string(&mut request.as_reader(), &mut body);

        let (status, payload) = handle_api_request(accessories, &method, path, &body);
        request.respond(json_response(status, &payload)).ok();
    }

    Ok(())
}

pub fn handle_api_request(
    accessories: &[FanAccessory],
    method: &Method,
    path: &str,
    body: &str,
) -> (StatusCode, Value) {
    match (method, path) {
        (Method::Get, "/v1/health") => (StatusCode(200), json!({"status": "ok"})),
        (Method::Get, "/v1/accessories") => {
            let views = accessories.iter().map(view).collect::<Vec<_>>();
            (StatusCode(200), json!(views))
        }
        (_, path) if path.starts_with(ACCESSORIES_PREFIX) => {
            let rest = &path[ACCESSORIES_PREFIX.len()..];
            let (raw_name, action) = rest.split_once('/').unwrap_or((rest, ""));
            let name = urlencoding::decode(raw_name)
                .map(|value| value.into_owned())
                .unwrap_or_else(|_| raw_name.to_string());
            let Some(accessory) = accessories.iter().find(|item| item.name() == name) else {
                return json_error(StatusCode(404), format!("No accessory named '{name}'"));
            };
            handle_accessory_request(accessory, method, action, body)
        }
        _ => json_error(StatusCode(404), "Not found"),
    }
}

fn handle_accessory_request(
    accessory: &FanAccessory,
    method: &Method,
    action: &str,
    body: &str,
) -> (StatusCode, Value) {
    match (method, action) {
        (Method::Get, "") => (StatusCode(200), json!(view(accessory))),
        (Method::Post, "identify") => {
            accessory.identify();
            (StatusCode(200), json!({"identified": true}))
        }
        (Method::Post, "refresh") => match accessory.refresh() {
            Ok(()) => (StatusCode(200), json!(accessory.state())),
            Err(err) => error_reply(err),
        },
        (Method::Put, name) => {
            let Some(characteristic) = Characteristic::from_push_name(name) else {
                return error_reply(Error::UnknownCharacteristic(name.to_string()));
            };
            let request: SetRequest = match serde_json::from_str(body) {
                Ok(value) => value,
                Err(_) => return json_error(StatusCode(400), "Invalid JSON body for set request"),
            };
            let result = CharacteristicValue::from_json(characteristic, &request.value)
                .and_then(|value| accessory.set(value));
            match result {
                Ok(()) => (StatusCode(200), json!(accessory.state())),
                Err(err) => error_reply(err),
            }
        }
        _ => json_error(StatusCode(404), "Not found"),
    }
}

fn error_reply(err: Error) -> (StatusCode, Value) {
    let status = match &err {
        Error::InvalidValue { .. } | Error::Unsupported(_) | Error::UnknownCharacteristic(_) => {
            StatusCode(400)
        }
        Error::Transport(_) | Error::Parse(_) | Error::MissingField(_) => StatusCode(502),
        Error::Config(_) | Error::Bind { .. } | Error::Io(_) => StatusCode(500),
    };
    if status.0 >= 500 {
        warn!(error = %err, "host request failed");
    }
    json_error(status, err)
}

fn json_response(status: StatusCode, value: &Value) -> Response<std::io::Cursor<Vec<u8>>> {
    let body = serde_json::to_vec_pretty(value).unwrap_or_else(|_| b"{}".to_vec());
    let response = Response::from_data(body).with_status_code(status);
    match tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

fn json_error<E: std::fmt::Display>(status: StatusCode, err: E) -> (StatusCode, Value) {
    (status, json!({ "error": err.to_string() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FanConfig;
    use crate::test_support::{closed_url, FakeDevice};

    fn fan(name: &str, apiroute: &str) -> FanAccessory {
        let mut config = FanConfig::new(apiroute);
        config.name = name.to_string();
        config.rotation_speed = true;
        FanAccessory::new(config).unwrap()
    }

    #[test]
    fn lists_accessories_with_information_and_state() {
        let accessories = vec![fan("Bedroom", "http://a"), fan("Living Room", "http://b")];
        let (status, body) =
            handle_api_request(&accessories, &Method::Get, "/v1/accessories", "");
        assert_eq!(status.0, 200);
        assert_eq!(body[0]["name"], "Bedroom");
        assert_eq!(body[1]["information"]["serialNumber"], "http://b");
        assert_eq!(body[1]["state"]["on"]["status"], "unknown");

        let (status, body) = handle_api_request(
            &accessories,
            &Method::Get,
            "/v1/accessories/Living%20Room",
            "",
        );
        assert_eq!(status.0, 200);
        assert_eq!(body["name"], "Living Room");

        let (status, _) =
            handle_api_request(&accessories, &Method::Get, "/v1/accessories/Garage", "");
        assert_eq!(status.0, 404);
        let (status, _) = handle_api_request(&accessories, &Method::Get, "/v2", "");
        assert_eq!(status.0, 404);
    }

    #[test]
    fn put_sets_characteristic_through_device() {
        let device = FakeDevice::start("");
        let accessories = vec![fan("Bedroom", &device.url())];

        let (status, body) = handle_api_request(
            &accessories,
            &Method::Put,
            "/v1/accessories/Bedroom/rotationSpeed",
            r#"{"value": 70}"#,
        );
        assert_eq!(status.0, 200);
        assert_eq!(body["rotationSpeed"]["value"], 70);
        assert_eq!(
            device.next_request().unwrap().url,
            "/setRotationSpeed?value=70"
        );
    }

    #[test]
    fn put_rejects_bad_input_before_touching_device() {
        let device = FakeDevice::start("");
        let accessories = vec![fan("Bedroom", &device.url())];
        let cases = [
            ("/v1/accessories/Bedroom/brightness", r#"{"value": 1}"#),
            ("/v1/accessories/Bedroom/state", "not json"),
            ("/v1/accessories/Bedroom/state", r#"{"value": "maybe"}"#),
            ("/v1/accessories/Bedroom/rotationDirection", r#"{"value": 1}"#),
        ];
        for (path, body) in cases {
            let (status, reply) = handle_api_request(&accessories, &Method::Put, path, body);
            assert_eq!(status.0, 400, "{path} {body}");
            assert!(reply["error"].is_string());
        }
        assert_eq!(device.request_count(), 0);
    }

    #[test]
    fn device_failures_map_to_bad_gateway() {
        let accessories = vec![fan("Bedroom", &closed_url())];
        let (status, _) = handle_api_request(
            &accessories,
            &Method::Put,
            "/v1/accessories/Bedroom/state",
            r#"{"value": true}"#,
        );
        assert_eq!(status.0, 502);

        let (status, _) = handle_api_request(
            &accessories,
            &Method::Post,
            "/v1/accessories/Bedroom/refresh",
            "",
        );
        assert_eq!(status.0, 502);
        assert!(accessories[0].state().on.is_failed());
    }

    #[test]
    fn refresh_and_identify() {
        let device = FakeDevice::start(r#"{"currentState": 1, "rotationSpeed": 12}"#);
        let accessories = vec![fan("Bedroom", &device.url())];

        let (status, body) = handle_api_request(
            &accessories,
            &Method::Post,
            "/v1/accessories/Bedroom/refresh",
            "",
        );
        assert_eq!(status.0, 200);
        assert_eq!(body["on"]["value"], true);
        assert_eq!(body["rotationSpeed"]["value"], 12);

        let (status, body) = handle_api_request(
            &accessories,
            &Method::Post,
            "/v1/accessories/Bedroom/identify",
            "",
        );
        assert_eq!(status.0, 200);
        assert_eq!(body["identified"], true);
    }
}
