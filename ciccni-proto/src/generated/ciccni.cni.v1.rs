/// Arguments forwarded verbatim from the CNI shim invocation.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CniCmdArgs {
    #[prost(string, tag = "1")]
    pub container_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub netns: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub ifname: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub args: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub path: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "6")]
    pub network_configuration: ::prost::alloc::vec::Vec<u8>,
}
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CniCmdRequest {
    #[prost(message, optional, tag = "1")]
    pub cni_args: ::core::option::Option<CniCmdArgs>,
}
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CniCmdResponse {
    /// Serialized CNI Result JSON; empty for DEL and CHECK.
    #[prost(bytes = "vec", tag = "1")]
    pub cni_result: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub error: ::core::option::Option<Error>,
}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Unknown = 0,
    IncompatibleCniVersion = 1,
    UnsupportedField = 2,
    UnknownContainer = 3,
    InvalidEnvironmentVariables = 4,
    IoFailure = 5,
    DecodingFailure = 6,
    InvalidNetworkConfig = 7,
    TryAgainLater = 11,
    IpamFailure = 101,
    ConfigInterfaceFailure = 102,
    CheckInterfaceFailure = 103,
    /// These codes are produced by the shim side only; reserved here so both
    /// ends agree on the numbering.
    UnknownRpcError = 201,
    IncompatibleApiVersion = 202,
}
impl ErrorCode {
    /// String value of the enum field names used in the ProtoBuf definition.
    ///
    /// The values are not transformed in any way and thus are considered stable
    /// (if the ProtoBuf definition does not change) and safe for programmatic use.
    pub fn as_str_name(&self) -> &'static str {
        match self {
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::IncompatibleCniVersion => "INCOMPATIBLE_CNI_VERSION",
            ErrorCode::UnsupportedField => "UNSUPPORTED_FIELD",
            ErrorCode::UnknownContainer => "UNKNOWN_CONTAINER",
            ErrorCode::InvalidEnvironmentVariables => "INVALID_ENVIRONMENT_VARIABLES",
            ErrorCode::IoFailure => "IO_FAILURE",
            ErrorCode::DecodingFailure => "DECODING_FAILURE",
            ErrorCode::InvalidNetworkConfig => "INVALID_NETWORK_CONFIG",
            ErrorCode::TryAgainLater => "TRY_AGAIN_LATER",
            ErrorCode::IpamFailure => "IPAM_FAILURE",
            ErrorCode::ConfigInterfaceFailure => "CONFIG_INTERFACE_FAILURE",
            ErrorCode::CheckInterfaceFailure => "CHECK_INTERFACE_FAILURE",
            ErrorCode::UnknownRpcError => "UNKNOWN_RPC_ERROR",
            ErrorCode::IncompatibleApiVersion => "INCOMPATIBLE_API_VERSION",
        }
    }
    /// Creates an enum from field names used in the ProtoBuf definition.
    pub fn from_str_name(value: &str) -> ::core::option::Option<Self> {
        match value {
            "UNKNOWN" => Some(Self::Unknown),
            "INCOMPATIBLE_CNI_VERSION" => Some(Self::IncompatibleCniVersion),
            "UNSUPPORTED_FIELD" => Some(Self::UnsupportedField),
            "UNKNOWN_CONTAINER" => Some(Self::UnknownContainer),
            "INVALID_ENVIRONMENT_VARIABLES" => Some(Self::InvalidEnvironmentVariables),
            "IO_FAILURE" => Some(Self::IoFailure),
            "DECODING_FAILURE" => Some(Self::DecodingFailure),
            "INVALID_NETWORK_CONFIG" => Some(Self::InvalidNetworkConfig),
            "TRY_AGAIN_LATER" => Some(Self::TryAgainLater),
            "IPAM_FAILURE" => Some(Self::IpamFailure),
            "CONFIG_INTERFACE_FAILURE" => Some(Self::ConfigInterfaceFailure),
            "CHECK_INTERFACE_FAILURE" => Some(Self::CheckInterfaceFailure),
            "UNKNOWN_RPC_ERROR" => Some(Self::UnknownRpcError),
            "INCOMPATIBLE_API_VERSION" => Some(Self::IncompatibleApiVersion),
            _ => None,
        }
    }
}
/// Generated client implementations.
pub mod cni_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::let_unit_value)]
    use tonic::codegen::http::Uri;
    use tonic::codegen::*;
    /// CNI request service exposed on the local UNIX socket.
    #[derive(Debug, Clone)]
    pub struct CniClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl CniClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }
    impl<T> CniClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }
        pub fn with_origin(inner: T, origin: Uri) -> Self {
            let inner = tonic::client::Grpc::with_origin(inner, origin);
            Self { inner }
        }
        pub fn with_interceptor<F>(
            inner: T,
            interceptor: F,
        ) -> CniClient<InterceptedService<T, F>>
        where
            F: tonic::service::Interceptor,
            T::ResponseBody: Default,
            T: tonic::codegen::Service<
                http::Request<tonic::body::BoxBody>,
                Response = http::Response<
                    <T as tonic::client::GrpcService<tonic::body::BoxBody>>::ResponseBody,
                >,
            >,
            <T as tonic::codegen::Service<
                http::Request<tonic::body::BoxBody>,
            >>::Error: Into<StdError> + Send + Sync,
        {
            CniClient::new(InterceptedService::new(inner, interceptor))
        }
        /// Compress requests with the given encoding.
        ///
        /// This requires the server to support it otherwise it might respond with an
        /// error.
        #[must_use]
        pub fn send_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.inner = self.inner.send_compressed(encoding);
            self
        }
        /// Enable decompressing responses.
        #[must_use]
        pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.inner = self.inner.accept_compressed(encoding);
            self
        }
        /// Limits the maximum size of a decoded message.
        ///
        /// Default: `4MB`
        #[must_use]
        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.inner = self.inner.max_decoding_message_size(limit);
            self
        }
        /// Limits the maximum size of an encoded message.
        ///
        /// Default: `usize::MAX`
        #[must_use]
        pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
            self.inner = self.inner.max_encoding_message_size(limit);
            self
        }
        pub async fn cmd_add(
            &mut self,
            request: impl tonic::IntoRequest<super::CniCmdRequest>,
        ) -> std::result::Result<
            tonic::Response<super::CniCmdResponse>,
            tonic::Status,
        > {
            self.inner
                .ready()
                .await
                .map_err(|e| {
                    tonic::Status::new(
                        tonic::Code::Unknown,
                        format!("Service was not ready: {}", e.into()),
                    )
                })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/ciccni.cni.v1.Cni/CmdAdd",
            );
            let mut req = request.into_request();
            req.extensions_mut().insert(GrpcMethod::new("ciccni.cni.v1.Cni", "CmdAdd"));
            self.inner.unary(req, path, codec).await
        }
        pub async fn cmd_check(
            &mut self,
            request: impl tonic::IntoRequest<super::CniCmdRequest>,
        ) -> std::result::Result<
            tonic::Response<super::CniCmdResponse>,
            tonic::Status,
        > {
            self.inner
                .ready()
                .await
                .map_err(|e| {
                    tonic::Status::new(
                        tonic::Code::Unknown,
                        format!("Service was not ready: {}", e.into()),
                    )
                })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/ciccni.cni.v1.Cni/CmdCheck",
            );
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("ciccni.cni.v1.Cni", "CmdCheck"));
            self.inner.unary(req, path, codec).await
        }
        pub async fn cmd_del(
            &mut self,
            request: impl tonic::IntoRequest<super::CniCmdRequest>,
        ) -> std::result::Result<
            tonic::Response<super::CniCmdResponse>,
            tonic::Status,
        > {
            self.inner
                .ready()
                .await
                .map_err(|e| {
                    tonic::Status::new(
                        tonic::Code::Unknown,
                        format!("Service was not ready: {}", e.into()),
                    )
                })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/ciccni.cni.v1.Cni/CmdDel",
            );
            let mut req = request.into_request();
            req.extensions_mut().insert(GrpcMethod::new("ciccni.cni.v1.Cni", "CmdDel"));
            self.inner.unary(req, path, codec).await
        }
    }
}
/// Generated server implementations.
pub mod cni_server {
    #![allow(unused_variables, dead_code, missing_docs, clippy::let_unit_value)]
    use tonic::codegen::*;
    /// Generated trait containing gRPC methods that should be implemented for use with CniServer.
    #[async_trait]
    pub trait Cni: Send + Sync + 'static {
        async fn cmd_add(
            &self,
            request: tonic::Request<super::CniCmdRequest>,
        ) -> std::result::Result<tonic::Response<super::CniCmdResponse>, tonic::Status>;
        async fn cmd_check(
            &self,
            request: tonic::Request<super::CniCmdRequest>,
        ) -> std::result::Result<tonic::Response<super::CniCmdResponse>, tonic::Status>;
        async fn cmd_del(
            &self,
            request: tonic::Request<super::CniCmdRequest>,
        ) -> std::result::Result<tonic::Response<super::CniCmdResponse>, tonic::Status>;
    }
    /// CNI request service exposed on the local UNIX socket.
    #[derive(Debug)]
    pub struct CniServer<T: Cni> {
        inner: _Inner<T>,
        accept_compression_encodings: EnabledCompressionEncodings,
        send_compression_encodings: EnabledCompressionEncodings,
        max_decoding_message_size: Option<usize>,
        max_encoding_message_size: Option<usize>,
    }
    struct _Inner<T>(Arc<T>);
    impl<T: Cni> CniServer<T> {
        pub fn new(inner: T) -> Self {
            Self::from_arc(Arc::new(inner))
        }
        pub fn from_arc(inner: Arc<T>) -> Self {
            let inner = _Inner(inner);
            Self {
                inner,
                accept_compression_encodings: Default::default(),
                send_compression_encodings: Default::default(),
                max_decoding_message_size: None,
                max_encoding_message_size: None,
            }
        }
        pub fn with_interceptor<F>(
            inner: T,
            interceptor: F,
        ) -> InterceptedService<Self, F>
        where
            F: tonic::service::Interceptor,
        {
            InterceptedService::new(Self::new(inner), interceptor)
        }
        /// Enable decompressing requests with the given encoding.
        #[must_use]
        pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.accept_compression_encodings.enable(encoding);
            self
        }
        /// Compress responses with the given encoding, if the client supports it.
        #[must_use]
        pub fn send_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.send_compression_encodings.enable(encoding);
            self
        }
        /// Limits the maximum size of a decoded message.
        ///
        /// Default: `4MB`
        #[must_use]
        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.max_decoding_message_size = Some(limit);
            self
        }
        /// Limits the maximum size of an encoded message.
        ///
        /// Default: `usize::MAX`
        #[must_use]
        pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
            self.max_encoding_message_size = Some(limit);
            self
        }
    }
    impl<T, B> tonic::codegen::Service<http::Request<B>> for CniServer<T>
    where
        T: Cni,
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;
        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            let inner = self.inner.clone();
            match req.uri().path() {
                "/ciccni.cni.v1.Cni/CmdAdd" => {
                    #[allow(non_camel_case_types)]
                    struct CmdAddSvc<T: Cni>(pub Arc<T>);
                    impl<T: Cni> tonic::server::UnaryService<super::CniCmdRequest>
                    for CmdAddSvc<T> {
                        type Response = super::CniCmdResponse;
                        type Future = BoxFuture<
                            tonic::Response<Self::Response>,
                            tonic::Status,
                        >;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::CniCmdRequest>,
                        ) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            let fut = async move {
                                <T as Cni>::cmd_add(&inner, request).await
                            };
                            Box::pin(fut)
                        }
                    }
                    let accept_compression_encodings = self.accept_compression_encodings;
                    let send_compression_encodings = self.send_compression_encodings;
                    let max_decoding_message_size = self.max_decoding_message_size;
                    let max_encoding_message_size = self.max_encoding_message_size;
                    let inner = self.inner.clone();
                    let fut = async move {
                        let inner = inner.0;
                        let method = CmdAddSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec)
                            .apply_compression_config(
                                accept_compression_encodings,
                                send_compression_encodings,
                            )
                            .apply_max_message_size_config(
                                max_decoding_message_size,
                                max_encoding_message_size,
                            );
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/ciccni.cni.v1.Cni/CmdCheck" => {
                    #[allow(non_camel_case_types)]
                    struct CmdCheckSvc<T: Cni>(pub Arc<T>);
                    impl<T: Cni> tonic::server::UnaryService<super::CniCmdRequest>
                    for CmdCheckSvc<T> {
                        type Response = super::CniCmdResponse;
                        type Future = BoxFuture<
                            tonic::Response<Self::Response>,
                            tonic::Status,
                        >;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::CniCmdRequest>,
                        ) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            let fut = async move {
                                <T as Cni>::cmd_check(&inner, request).await
                            };
                            Box::pin(fut)
                        }
                    }
                    let accept_compression_encodings = self.accept_compression_encodings;
                    let send_compression_encodings = self.send_compression_encodings;
                    let max_decoding_message_size = self.max_decoding_message_size;
                    let max_encoding_message_size = self.max_encoding_message_size;
                    let inner = self.inner.clone();
                    let fut = async move {
                        let inner = inner.0;
                        let method = CmdCheckSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec)
                            .apply_compression_config(
                                accept_compression_encodings,
                                send_compression_encodings,
                            )
                            .apply_max_message_size_config(
                                max_decoding_message_size,
                                max_encoding_message_size,
                            );
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/ciccni.cni.v1.Cni/CmdDel" => {
                    #[allow(non_camel_case_types)]
                    struct CmdDelSvc<T: Cni>(pub Arc<T>);
                    impl<T: Cni> tonic::server::UnaryService<super::CniCmdRequest>
                    for CmdDelSvc<T> {
                        type Response = super::CniCmdResponse;
                        type Future = BoxFuture<
                            tonic::Response<Self::Response>,
                            tonic::Status,
                        >;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::CniCmdRequest>,
                        ) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            let fut = async move {
                                <T as Cni>::cmd_del(&inner, request).await
                            };
                            Box::pin(fut)
                        }
                    }
                    let accept_compression_encodings = self.accept_compression_encodings;
                    let send_compression_encodings = self.send_compression_encodings;
                    let max_decoding_message_size = self.max_decoding_message_size;
                    let max_encoding_message_size = self.max_encoding_message_size;
                    let inner = self.inner.clone();
                    let fut = async move {
                        let inner = inner.0;
                        let method = CmdDelSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec)
                            .apply_compression_config(
                                accept_compression_encodings,
                                send_compression_encodings,
                            )
                            .apply_max_message_size_config(
                                max_decoding_message_size,
                                max_encoding_message_size,
                            );
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                _ => {
                    Box::pin(async move {
                        Ok(
                            http::Response::builder()
                                .status(200)
                                .header("grpc-status", "12")
                                .header("content-type", "application/grpc")
                                .body(empty_body())
                                .unwrap(),
                        )
                    })
                }
            }
        }
    }
    impl<T: Cni> Clone for CniServer<T> {
        fn clone(&self) -> Self {
            let inner = self.inner.clone();
            Self {
                inner,
                accept_compression_encodings: self.accept_compression_encodings,
                send_compression_encodings: self.send_compression_encodings,
                max_decoding_message_size: self.max_decoding_message_size,
                max_encoding_message_size: self.max_encoding_message_size,
            }
        }
    }
    impl<T> Clone for _Inner<T> {
        fn clone(&self) -> Self {
            Self(Arc::clone(&self.0))
        }
    }
    impl<T: std::fmt::Debug> std::fmt::Debug for _Inner<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "Inner {{ ... }}")
        }
    }
    impl<T: Cni> tonic::server::NamedService for CniServer<T> {
        const NAME: &'static str = "ciccni.cni.v1.Cni";
    }
}
