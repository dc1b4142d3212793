//! Write operations and the cache keys each one touches.
//!
//! A [`MutationRequest`] pairs the HTTP call with the keys to invalidate and
//! remove once the server accepts it. Writes of the returned entity and list
//! patches depend on the response and are added by the client.

use super::keys;
use super::request::ApiRequest;
use super::types::{
  BookRequest, CategoryRequest, CreateOrderRequest, CreateTransactionRequest, EsewaPaymentRequest,
  EsewaResponseData, TransactionUpdateRequest, UpdateOrderStatusRequest,
};
use crate::cache::ResourceKey;
use crate::error::FetchError;

#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
  pub request: ApiRequest,
  pub invalidates: Vec<ResourceKey>,
  /// Invalidated along with every key below them
  pub invalidates_prefixes: Vec<ResourceKey>,
  pub removes: Vec<ResourceKey>,
}

impl MutationRequest {
  fn new(request: ApiRequest) -> Self {
    Self {
      request,
      invalidates: Vec::new(),
      invalidates_prefixes: Vec::new(),
      removes: Vec::new(),
    }
  }

  fn invalidate(mut self, key: ResourceKey) -> Self {
    self.invalidates.push(key);
    self
  }

  fn invalidate_prefix(mut self, prefix: ResourceKey) -> Self {
    self.invalidates_prefixes.push(prefix);
    self
  }

  fn remove(mut self, key: ResourceKey) -> Self {
    self.removes.push(key);
    self
  }

  // Books

  pub fn create_book(book: &BookRequest) -> Result<Self, FetchError> {
    book.validate()?;
    Ok(Self::new(ApiRequest::post("/books", book)?).invalidate(keys::books()))
  }

  pub fn update_book(id: &str, book: &BookRequest) -> Result<Self, FetchError> {
    book.validate()?;
    Ok(Self::new(ApiRequest::put(format!("/books/{id}"), book)?).invalidate(keys::books()))
  }

  pub fn delete_book(id: &str) -> Self {
    Self::new(ApiRequest::delete(format!("/books/{id}")))
      .remove(keys::book(id))
      .invalidate(keys::books())
  }

  // Categories

  pub fn create_category(category: &CategoryRequest) -> Result<Self, FetchError> {
    category.validate()?;
    Ok(Self::new(ApiRequest::post("/categories", category)?).invalidate(keys::categories()))
  }

  /// Books embed their category, so they are refreshed too.
  pub fn update_category(id: &str, category: &CategoryRequest) -> Result<Self, FetchError> {
    category.validate()?;
    Ok(
      Self::new(ApiRequest::put(format!("/categories/{id}"), category)?)
        .invalidate(keys::categories())
        .invalidate(keys::books()),
    )
  }

  pub fn delete_category(id: &str) -> Self {
    Self::new(ApiRequest::delete(format!("/categories/{id}")))
      .remove(keys::category(id))
      .invalidate(keys::categories())
      .invalidate(keys::books())
  }

  // Orders

  pub fn create_order(order: &CreateOrderRequest) -> Result<Self, FetchError> {
    order.validate()?;
    Ok(
      Self::new(ApiRequest::post("/orders", order)?)
        .invalidate(keys::orders())
        .invalidate_prefix(keys::user_orders_prefix()),
    )
  }

  pub fn update_order_status(id: &str, status: &UpdateOrderStatusRequest) -> Result<Self, FetchError> {
    Ok(
      Self::new(ApiRequest::put(format!("/orders/{id}/status"), status)?)
        .invalidate(keys::orders())
        .invalidate_prefix(keys::user_orders_prefix()),
    )
  }

  pub fn delete_order(id: &str) -> Self {
    Self::new(ApiRequest::delete(format!("/orders/{id}")))
      .remove(keys::order(id))
      .invalidate(keys::orders())
      .invalidate_prefix(keys::user_orders_prefix())
  }

  // Transactions

  pub fn create_transaction(transaction: &CreateTransactionRequest) -> Result<Self, FetchError> {
    transaction.validate()?;
    Ok(
      Self::new(ApiRequest::post("/transactions", transaction)?)
        .invalidate(keys::transactions())
        .invalidate(keys::user_transactions()),
    )
  }

  pub fn update_transaction_status(
    id: &str,
    update: &TransactionUpdateRequest,
  ) -> Result<Self, FetchError> {
    Ok(
      Self::new(ApiRequest::put(format!("/transactions/{id}/status"), update)?)
        .invalidate(keys::transactions())
        .invalidate(keys::user_transactions()),
    )
  }

  pub fn delete_transaction(id: &str) -> Self {
    Self::new(ApiRequest::delete(format!("/transactions/{id}")))
      .remove(keys::transaction(id))
      .invalidate(keys::transactions())
      .invalidate(keys::user_transactions())
  }

  pub fn initiate_esewa(transaction_id: &str, payment: &EsewaPaymentRequest) -> Result<Self, FetchError> {
    payment.validate()?;
    let request =
      ApiRequest::post("/transactions/esewa/initiate", payment)?.with_query("transaction_id", transaction_id);
    Ok(
      Self::new(request)
        .invalidate(keys::user_transactions())
        .invalidate(keys::transaction(transaction_id)),
    )
  }

  pub fn verify_esewa(response: &EsewaResponseData) -> Result<Self, FetchError> {
    Ok(
      Self::new(ApiRequest::post("/transactions/esewa/verify", response)?)
        .invalidate(keys::transactions())
        .invalidate(keys::user_transactions()),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::request::Method;
  use crate::api::types::OrderStatus;

  #[test]
  fn test_delete_book_declares_keys() {
    let m = MutationRequest::delete_book("b1");
    assert_eq!(m.request.method, Method::Delete);
    assert_eq!(m.request.path, "/books/b1");
    assert_eq!(m.removes, vec![keys::book("b1")]);
    assert_eq!(m.invalidates, vec![keys::books()]);
  }

  #[test]
  fn test_order_mutations_invalidate_user_lists() {
    let m = MutationRequest::update_order_status(
      "o1",
      &UpdateOrderStatusRequest {
        status: OrderStatus::Paid,
      },
    )
    .unwrap();
    assert_eq!(m.request.path, "/orders/o1/status");
    assert_eq!(m.request.body.as_ref().unwrap()["status"], "PAID");
    assert_eq!(m.invalidates_prefixes, vec![keys::user_orders_prefix()]);
  }

  #[test]
  fn test_invalid_payload_builds_no_request() {
    let err = MutationRequest::create_category(&CategoryRequest { name: " ".into() }).unwrap_err();
    assert!(matches!(err, FetchError::Validation(_)));
  }

  #[test]
  fn test_initiate_esewa_carries_transaction_id() {
    let payment = EsewaPaymentRequest {
      amount: 10.0,
      tax_amount: 0.0,
      product_code: "EPAYTEST".into(),
      product_name: "Books".into(),
      product_service_charge: 0.0,
      product_delivery_charge: 0.0,
      success_url: "http://localhost:5173/success".into(),
      failure_url: "http://localhost:5173/failure".into(),
      signed_field_names: None,
      signature: None,
    };
    let m = MutationRequest::initiate_esewa("t9", &payment).unwrap();
    assert_eq!(m.request.query, vec![("transaction_id".to_string(), "t9".to_string())]);
    assert_eq!(
      m.invalidates,
      vec![keys::user_transactions(), keys::transaction("t9")]
    );
  }
}
