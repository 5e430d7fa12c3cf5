use bytes::Bytes;
use courier::{Body, Error};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{Method, StatusCode};

mod common;
use common::{ok, origin, redirect, setup, BoxError, Recorded};

fn echo_method(recorded: &Recorded) -> http::Response<http_body_util::Full<Bytes>> {
    ok(format!("{} {}", recorded.method, recorded.body.len()))
}

#[tokio::test]
async fn post_found_becomes_get() -> Result<(), BoxError> {
    let (session, server) = setup(
        |b| b,
        |recorded| async move {
            match recorded.uri.path() {
                "/submit" => redirect(StatusCode::FOUND, "/result"),
                _ => echo_method(&recorded),
            }
        },
    );

    let response = session
        .post("http://example.com/submit")
        .header(CONTENT_TYPE, "text/plain")
        .body("form data")
        .send()
        .await?;
    assert_eq!(response.url(), "http://example.com/result");
    assert_eq!(response.request().method(), &Method::GET);
    assert_eq!(response.text().await?, "GET 0");

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, Method::POST);
    assert_eq!(requests[0].body, "form data");
    assert!(requests[1].headers.get(CONTENT_TYPE).is_none());
    assert!(requests[1].headers.get("content-length").map_or(true, |v| v == "0"));

    // The redirect body was drained, so both requests shared one connection.
    assert_eq!(server.connections(), 1);
    Ok(())
}

#[tokio::test]
async fn see_other_becomes_get() -> Result<(), BoxError> {
    let (session, _server) = setup(
        |b| b,
        |recorded| async move {
            match recorded.uri.path() {
                "/items" => redirect(StatusCode::SEE_OTHER, "/items/7"),
                _ => echo_method(&recorded),
            }
        },
    );

    let response = session.put("http://example.com/items").body("item").send().await?;
    assert_eq!(response.text().await?, "GET 0");
    Ok(())
}

#[tokio::test]
async fn temporary_redirect_replays_put_body() -> Result<(), BoxError> {
    let (session, server) = setup(
        |b| b,
        |recorded| async move {
            match recorded.uri.path() {
                "/old" => redirect(StatusCode::TEMPORARY_REDIRECT, "/new"),
                _ => echo_method(&recorded),
            }
        },
    );

    let response = session
        .put("http://example.com/old")
        .body("replayed payload")
        .send()
        .await?;
    assert_eq!(response.text().await?, "PUT 16");

    let requests = server.requests();
    assert_eq!(requests[1].method, Method::PUT);
    assert_eq!(requests[1].body, "replayed payload");
    Ok(())
}

#[tokio::test]
async fn permanent_redirect_replays_restartable_stream() -> Result<(), BoxError> {
    let (session, server) = setup(
        |b| b,
        |recorded| async move {
            match recorded.uri.path() {
                "/old" => redirect(StatusCode::PERMANENT_REDIRECT, "/new"),
                _ => echo_method(&recorded),
            }
        },
    );

    let body = Body::restartable(|| {
        futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from("part one, ")),
            Ok(Bytes::from("part two")),
        ])
    });
    let response = session.put("http://example.com/old").body(body).send().await?;
    assert_eq!(response.text().await?, "PUT 18");
    assert_eq!(server.requests()[1].body, "part one, part two");
    Ok(())
}

#[cfg(feature = "multipart")]
#[tokio::test]
async fn temporary_redirect_replays_multipart_form() -> Result<(), BoxError> {
    use courier::multipart::{Form, Part};

    let (session, server) = setup(
        |b| b,
        |recorded| async move {
            match recorded.uri.path() {
                "/upload" => redirect(StatusCode::TEMPORARY_REDIRECT, "/v2/upload"),
                _ => echo_method(&recorded),
            }
        },
    );

    let form = Form::new()
        .text("album", "summer")
        .part("photo", Part::bytes(&b"not really a png"[..]).file_name("beach.png"));
    let boundary = form.boundary().to_owned();
    let length = form.content_length();

    let response = session
        .post("http://example.com/upload")
        .multipart(form)
        .send()
        .await?;
    assert_eq!(response.text().await?, format!("POST {length}"));

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].uri, "/v2/upload");
    assert_eq!(requests[0].body, requests[1].body);
    assert_eq!(
        requests[1].headers.get(CONTENT_TYPE).unwrap().to_str()?,
        format!("multipart/form-data; boundary={boundary}")
    );
    let body = std::str::from_utf8(&requests[1].body)?;
    assert!(body.contains("name=\"photo\"; filename=\"beach.png\"\r\nContent-Type: image/png\r\n"));
    assert!(body.ends_with(&format!("--{boundary}--\r\n")));
    Ok(())
}

#[tokio::test]
async fn one_shot_stream_cannot_follow_temporary_redirect() -> Result<(), BoxError> {
    let (session, _server) = setup(
        |b| b,
        |_| async { redirect(StatusCode::TEMPORARY_REDIRECT, "/elsewhere") },
    );

    let body = Body::stream(futures_util::stream::iter(vec![Ok::<_, std::io::Error>(
        Bytes::from("once"),
    )]));
    let error = session
        .post("http://example.com/upload")
        .body(body)
        .send()
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        Error::NonRestartableRedirectBody { status } if status == StatusCode::TEMPORARY_REDIRECT
    ));
    Ok(())
}

#[tokio::test]
async fn redirect_chain_is_limited() -> Result<(), BoxError> {
    let (session, server) = setup(
        |b| b.with_max_redirects(10),
        |recorded| async move {
            let hop: usize = recorded
                .uri
                .path()
                .trim_start_matches("/hop/")
                .parse()
                .unwrap_or(0);
            redirect(StatusCode::MOVED_PERMANENTLY, &format!("/hop/{}", hop + 1))
        },
    );

    let error = session.get("http://example.com/hop/0").send().await.unwrap_err();
    match error {
        Error::TooManyRedirects { limit, location } => {
            assert_eq!(limit, 10);
            assert_eq!(location, "http://example.com/hop/11");
        }
        other => panic!("unexpected error: {other}"),
    }

    // The original request plus ten redirects, and no twelfth request.
    assert_eq!(server.requests().len(), 11);
    Ok(())
}

#[tokio::test]
async fn redirects_can_be_disabled_per_request() -> Result<(), BoxError> {
    let (session, server) = setup(
        |b| b,
        |_| async { redirect(StatusCode::FOUND, "/elsewhere") },
    );

    let response = session
        .get("http://example.com/")
        .follow_redirects(false)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers().get("location").unwrap(), "/elsewhere");
    assert_eq!(server.requests().len(), 1);
    Ok(())
}

#[tokio::test]
async fn session_without_redirects_returns_redirect() -> Result<(), BoxError> {
    let (session, _server) = setup(
        |b| b.without_redirects(),
        |_| async { redirect(StatusCode::MOVED_PERMANENTLY, "/elsewhere") },
    );

    let response = session.get("http://example.com/").send().await?;
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    Ok(())
}

#[tokio::test]
async fn authorization_is_dropped_across_origins() -> Result<(), BoxError> {
    let (session, server) = setup(
        |b| b,
        |recorded| async move {
            match recorded.uri.path() {
                "/start" => redirect(StatusCode::FOUND, "/same"),
                "/same" => redirect(StatusCode::FOUND, "http://other.example/landing"),
                _ => ok("landed"),
            }
        },
    );

    let response = session
        .get("http://example.com/start")
        .header(AUTHORIZATION, "Bearer secret")
        .send()
        .await?;
    assert_eq!(response.url(), "http://other.example/landing");
    assert_eq!(response.text().await?, "landed");

    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].headers.get(AUTHORIZATION).unwrap(), "Bearer secret");
    assert_eq!(requests[1].headers.get(AUTHORIZATION).unwrap(), "Bearer secret");
    assert!(requests[2].headers.get(AUTHORIZATION).is_none());
    assert_eq!(requests[2].origin, origin("http://other.example"));
    assert_eq!(requests[2].headers.get("host").unwrap(), "other.example");
    Ok(())
}

#[tokio::test]
async fn redirect_without_location_is_returned() -> Result<(), BoxError> {
    let (session, _server) = setup(
        |b| b,
        |_| async { common::respond(StatusCode::FOUND, "nowhere") },
    );

    let response = session.get("http://example.com/").send().await?;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.text().await?, "nowhere");
    Ok(())
}
