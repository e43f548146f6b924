/// Subject and plain-text body for a price alert.
pub fn alert_message(ticker: &str, currency: &str, price: f64) -> (String, String) {
    let subject = format!("Stock Price Alert for {}", ticker);
    let body = format!(
        "The stock price of {} has reached {}{:.2}",
        ticker, currency, price
    );
    (subject, body)
}
