pub mod mailer;
pub mod mercadopago;
