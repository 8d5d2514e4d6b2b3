//! Integration tests for atlaspub-api
//!
//! Uses wiremock to stand in for the OAuth server, the REST API and the
//! pre-signed storage endpoint, and verifies the end-to-end behavior of
//! the auth workflow, gateway, pagination, list models and uploads.

mod common;

mod test_gateway;
mod test_lists;
mod test_upload;
