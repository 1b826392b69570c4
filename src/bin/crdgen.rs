use jaeger_nginx_proxy_operator::controllers::proxy::JaegerNginxProxy;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&JaegerNginxProxy::crd())?);
    Ok(())
}
